// Result cache
//
// Keyed by (dataset id, tag). The sqlite index has one table for stored
// files and one for stored data; each tag is a column added on first use and
// each dataset a row. Cell values are paths below `files/<dataset>/`.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CacheError;

const FILES_TABLE: &str = "stored_files";
const DATA_TABLE: &str = "stored_data";
const ID_COLUMN: &str = "id";

/// Tabular result data
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// A structured value stored in the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CachedData {
    /// Stored as tab-separated text
    Table(DataTable),
    /// Stored as gzip-compressed JSON
    Value(Value),
}

/// A retrieved cache entry
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    File(PathBuf),
    Data(CachedData),
}

/// Where a stored file comes from
#[derive(Debug, Clone, Copy)]
pub enum FileSource<'a> {
    /// Copy an existing file, removing the original when `remove` is set
    Path { path: &'a Path, remove: bool },
    /// Write raw bytes under the given file name
    Bytes { bytes: &'a [u8], file_name: &'a str },
}

/// The result cache of one workflow
#[derive(Debug, Clone)]
pub struct ResultCache {
    root: PathBuf,
    db_path: PathBuf,
}

impl ResultCache {
    /// Open (or create) the cache below `root`
    pub fn open(root: &Path) -> Result<Self, CacheError> {
        let files_dir = root.join("files");
        fs::create_dir_all(&files_dir).map_err(|source| CacheError::Io {
            path: files_dir,
            source,
        })?;

        let cache = Self {
            root: root.to_path_buf(),
            db_path: root.join("cache.db"),
        };
        cache.ensure_schema()?;
        Ok(cache)
    }

    fn connect(&self) -> Result<Connection, CacheError> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(connection)
    }

    fn ensure_schema(&self) -> Result<(), CacheError> {
        let connection = self.connect()?;
        connection.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stored_files (id TEXT PRIMARY KEY);
            CREATE TABLE IF NOT EXISTS stored_data (id TEXT PRIMARY KEY);
            ",
        )?;
        Ok(())
    }

    fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.root.join("files").join(dataset)
    }

    /// Store structured data, replacing any previous value of the tag
    pub fn store_data(
        &self,
        dataset: &str,
        tag: &str,
        data: &CachedData,
    ) -> Result<PathBuf, CacheError> {
        validate_dataset(dataset)?;
        validate_tag(tag)?;

        let connection = self.connect()?;
        let name = find_column(&connection, DATA_TABLE, tag)?.unwrap_or_else(|| tag.to_string());
        let dir = self.dataset_dir(dataset);
        create_dir(&dir)?;
        let path = match data {
            CachedData::Table(table) => {
                let path = dir.join(format!("{}.tsv", name));
                write_table(&path, table)?;
                path
            }
            CachedData::Value(value) => {
                let path = dir.join(format!("{}.json.gz", name));
                write_json_gz(&path, value)?;
                path
            }
        };

        replace(&connection, DATA_TABLE, dataset, tag, &path)?;
        detach(&connection, FILES_TABLE, dataset, tag, &path)?;
        tracing::debug!("Cached data {}/{} at {:?}", dataset, tag, path);
        Ok(path)
    }

    /// Store any serializable value as compressed JSON
    pub fn store_value<T: serde::Serialize>(
        &self,
        dataset: &str,
        tag: &str,
        value: &T,
    ) -> Result<PathBuf, CacheError> {
        let value = serde_json::to_value(value).map_err(|source| CacheError::Serde {
            path: self.dataset_dir(dataset),
            source,
        })?;
        self.store_data(dataset, tag, &CachedData::Value(value))
    }

    /// Store a file as `<tag>.<extension>`, replacing any previous file of
    /// the tag
    pub fn store_file(
        &self,
        dataset: &str,
        tag: &str,
        source: FileSource<'_>,
    ) -> Result<PathBuf, CacheError> {
        validate_dataset(dataset)?;
        validate_tag(tag)?;

        let connection = self.connect()?;
        let name = find_column(&connection, FILES_TABLE, tag)?.unwrap_or_else(|| tag.to_string());
        let dir = self.dataset_dir(dataset);
        create_dir(&dir)?;

        let target = match source {
            FileSource::Path { path, remove } => {
                let target = dir.join(tagged_file_name(&name, path));
                if path != target {
                    fs::copy(path, &target).map_err(|source| CacheError::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    if remove {
                        fs::remove_file(path).map_err(|source| CacheError::Io {
                            path: path.to_path_buf(),
                            source,
                        })?;
                    }
                }
                target
            }
            FileSource::Bytes { bytes, file_name } => {
                let target = dir.join(tagged_file_name(&name, Path::new(file_name)));
                fs::write(&target, bytes).map_err(|source| CacheError::Io {
                    path: target.clone(),
                    source,
                })?;
                target
            }
        };

        replace(&connection, FILES_TABLE, dataset, tag, &target)?;
        detach(&connection, DATA_TABLE, dataset, tag, &target)?;
        tracing::debug!("Cached file {}/{} at {:?}", dataset, tag, target);
        Ok(target)
    }

    /// Retrieve several tags of one dataset.
    ///
    /// With `partial` unset every tag must exist; otherwise missing tags
    /// are left out of the result.
    pub fn get_results(
        &self,
        dataset: &str,
        tags: &[&str],
        partial: bool,
    ) -> Result<BTreeMap<String, CacheEntry>, CacheError> {
        let connection = self.connect()?;
        let mut results = BTreeMap::new();

        for tag in tags {
            if let Some(path) = lookup(&connection, FILES_TABLE, dataset, tag)? {
                results.insert(tag.to_string(), CacheEntry::File(PathBuf::from(path)));
            } else if let Some(path) = lookup(&connection, DATA_TABLE, dataset, tag)? {
                let data = read_data(Path::new(&path))?;
                results.insert(tag.to_string(), CacheEntry::Data(data));
            } else if !partial {
                return Err(CacheError::MissingTag {
                    dataset: dataset.to_string(),
                    tag: tag.to_string(),
                });
            }
        }

        Ok(results)
    }

    /// Whether the tag has a stored value for the dataset
    pub fn result_exists(&self, dataset: &str, tag: &str) -> Result<bool, CacheError> {
        let connection = self.connect()?;
        Ok(lookup(&connection, FILES_TABLE, dataset, tag)?.is_some()
            || lookup(&connection, DATA_TABLE, dataset, tag)?.is_some())
    }

    /// Datasets having all (or, with `match_any`, any) of `tags`.
    /// An empty tag list selects every dataset.
    pub fn list_datasets(&self, tags: &[&str], match_any: bool) -> Result<Vec<String>, CacheError> {
        let connection = self.connect()?;
        let mut present: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for table in [FILES_TABLE, DATA_TABLE] {
            let tag_columns: Vec<String> = columns(&connection, table)?
                .into_iter()
                .filter(|column| column != ID_COLUMN)
                .collect();

            let mut statement = connection.prepare(&format!("SELECT * FROM {}", table))?;
            let all_columns: Vec<String> =
                statement.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = statement.query([])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(ID_COLUMN)?;
                let entry = present.entry(id).or_default();
                for (index, column) in all_columns.iter().enumerate() {
                    if tag_columns.contains(column) {
                        let value: Option<String> = row.get(index)?;
                        if value.is_some() {
                            entry.insert(column.to_ascii_lowercase());
                        }
                    }
                }
            }
        }

        Ok(present
            .into_iter()
            .filter(|(_, have)| {
                let has = |tag: &&str| have.contains(&tag.to_ascii_lowercase());
                if tags.is_empty() {
                    true
                } else if match_any {
                    tags.iter().any(has)
                } else {
                    tags.iter().all(has)
                }
            })
            .map(|(id, _)| id)
            .collect())
    }

    /// Remove every entry and file of a dataset
    pub fn remove(&self, dataset: &str) -> Result<(), CacheError> {
        validate_dataset(dataset)?;
        let connection = self.connect()?;
        for table in [FILES_TABLE, DATA_TABLE] {
            connection.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", table, ID_COLUMN),
                params![dataset],
            )?;
        }
        let dir = self.dataset_dir(dataset);
        crate::utils::remove_dir_if_exists(&dir).map_err(|source| CacheError::Io { path: dir, source })
    }

    /// Remove everything
    pub fn clear(&self) -> Result<(), CacheError> {
        {
            let connection = self.connect()?;
            connection.execute_batch(
                "
                DROP TABLE IF EXISTS stored_files;
                DROP TABLE IF EXISTS stored_data;
                ",
            )?;
        }
        let files_dir = self.root.join("files");
        crate::utils::remove_dir_if_exists(&files_dir).map_err(|source| CacheError::Io {
            path: files_dir.clone(),
            source,
        })?;
        create_dir(&files_dir)?;
        self.ensure_schema()
    }
}

fn validate_tag(tag: &str) -> Result<(), CacheError> {
    if tag.is_empty()
        || tag == "."
        || tag == ".."
        || tag.eq_ignore_ascii_case(ID_COLUMN)
        || tag.contains(['/', '\\', '\0'])
    {
        return Err(CacheError::InvalidTag(tag.to_string()));
    }
    Ok(())
}

fn validate_dataset(dataset: &str) -> Result<(), CacheError> {
    if dataset.is_empty()
        || dataset == "."
        || dataset == ".."
        || dataset.contains(['/', '\\', '\0'])
    {
        return Err(CacheError::InvalidDataset(dataset.to_string()));
    }
    Ok(())
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn create_dir(dir: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(dir).map_err(|source| CacheError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn columns(connection: &Connection, table: &str) -> Result<Vec<String>, CacheError> {
    let mut statement = connection.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = statement
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Existing tag column matching `tag`; sqlite identifiers ignore ASCII case
fn find_column(connection: &Connection, table: &str, tag: &str) -> Result<Option<String>, CacheError> {
    Ok(columns(connection, table)?
        .into_iter()
        .find(|column| column != ID_COLUMN && column.eq_ignore_ascii_case(tag)))
}

/// `<tag>.<extension of source>`, or just the tag for extensionless files
fn tagged_file_name(tag: &str, source: &Path) -> String {
    match source.extension() {
        Some(extension) => format!("{}.{}", tag, extension.to_string_lossy()),
        None => tag.to_string(),
    }
}

fn lookup(
    connection: &Connection,
    table: &str,
    dataset: &str,
    tag: &str,
) -> Result<Option<String>, CacheError> {
    let Some(column) = find_column(connection, table, tag)? else {
        return Ok(None);
    };
    let value: Option<Option<String>> = connection
        .query_row(
            &format!("SELECT {} FROM {} WHERE {} = ?1", quote(&column), table, ID_COLUMN),
            params![dataset],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

/// Point the tag at `path`, deleting the file it pointed at before
fn replace(
    connection: &Connection,
    table: &str,
    dataset: &str,
    tag: &str,
    path: &Path,
) -> Result<(), CacheError> {
    if let Some(previous) = lookup(connection, table, dataset, tag)? {
        let previous = PathBuf::from(previous);
        if previous != path {
            let _ = fs::remove_file(previous);
        }
    }
    upsert(connection, table, dataset, tag, path)
}

/// Drop the tag's entry from `table` so the other table's latest value wins
fn detach(
    connection: &Connection,
    table: &str,
    dataset: &str,
    tag: &str,
    keep: &Path,
) -> Result<(), CacheError> {
    let Some(previous) = lookup(connection, table, dataset, tag)? else {
        return Ok(());
    };
    let Some(column) = find_column(connection, table, tag)? else {
        return Ok(());
    };
    connection.execute(
        &format!("UPDATE {} SET {} = NULL WHERE {} = ?1", table, quote(&column), ID_COLUMN),
        params![dataset],
    )?;
    if Path::new(&previous) != keep {
        let _ = fs::remove_file(previous);
    }
    Ok(())
}

fn upsert(
    connection: &Connection,
    table: &str,
    dataset: &str,
    tag: &str,
    path: &Path,
) -> Result<(), CacheError> {
    let column = match find_column(connection, table, tag)? {
        Some(existing) => quote(&existing),
        None => {
            connection.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT;",
                table,
                quote(tag)
            ))?;
            quote(tag)
        }
    };
    connection.execute(
        &format!(
            "INSERT INTO {table} ({ID_COLUMN}, {column}) VALUES (?1, ?2)
             ON CONFLICT({ID_COLUMN}) DO UPDATE SET {column} = excluded.{column}"
        ),
        params![dataset, path.to_string_lossy().into_owned()],
    )?;
    Ok(())
}

fn escape_cell(cell: &str) -> String {
    cell.replace('\\', "\\\\")
        .replace('\t', "\\t")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

fn unescape_cell(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    let mut chars = cell.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn write_table(path: &Path, table: &DataTable) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    let header: Vec<String> = table.columns.iter().map(|c| escape_cell(c)).collect();
    writeln!(writer, "{}", header.join("\t")).map_err(io_err)?;
    for row in &table.rows {
        if row.len() != table.columns.len() {
            return Err(CacheError::Table {
                path: path.to_path_buf(),
                reason: format!("row has {} cells, expected {}", row.len(), table.columns.len()),
            });
        }
        let cells: Vec<String> = row.iter().map(|c| escape_cell(c)).collect();
        writeln!(writer, "{}", cells.join("\t")).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

fn read_table(path: &Path) -> Result<DataTable, CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut lines = reader.lines();
    let Some(header) = lines.next().transpose().map_err(io_err)? else {
        return Err(CacheError::Table {
            path: path.to_path_buf(),
            reason: "missing header".to_string(),
        });
    };

    let split = |line: &str| line.split('\t').map(unescape_cell).collect::<Vec<_>>();
    let columns = if header.is_empty() { Vec::new() } else { split(&header) };
    let mut rows = Vec::new();
    for line in lines {
        let line = line.map_err(io_err)?;
        let row = split(&line);
        if row.len() != columns.len() {
            return Err(CacheError::Table {
                path: path.to_path_buf(),
                reason: format!("row has {} cells, expected {}", row.len(), columns.len()),
            });
        }
        rows.push(row);
    }
    Ok(DataTable { columns, rows })
}

fn write_json_gz(path: &Path, value: &Value) -> Result<(), CacheError> {
    let file = File::create(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, value).map_err(|source| CacheError::Serde {
        path: path.to_path_buf(),
        source,
    })?;
    encoder
        .finish()
        .and_then(|mut writer| writer.flush())
        .map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read_data(path: &Path) -> Result<CachedData, CacheError> {
    let name = path.to_string_lossy();
    if name.ends_with(".tsv") {
        return read_table(path).map(CachedData::Table);
    }

    let file = File::open(path).map_err(|source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_reader(BufReader::new(GzDecoder::new(file))).map_err(|source| {
        CacheError::Serde {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(CachedData::Value(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_table() -> DataTable {
        DataTable {
            columns: vec!["mz".into(), "intensity".into(), "note".into()],
            rows: vec![
                vec!["100.5".into(), "2000".into(), "tab\there".into()],
                vec!["200.25".into(), "15".into(), "".into()],
            ],
        }
    }

    #[test]
    fn test_store_and_retrieve_mixed_entries() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(&temp_dir.path().join("cache")).unwrap();

        let source = temp_dir.path().join("sample1.featureXML");
        fs::write(&source, "<features/>").unwrap();

        let stored = cache
            .store_file("sample1", "features", FileSource::Path { path: &source, remove: true })
            .unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read_to_string(&stored).unwrap(), "<features/>");

        cache
            .store_data("sample1", "peaks", &CachedData::Table(sample_table()))
            .unwrap();
        cache
            .store_value("sample1", "summary", &json!({"ids": 42, "fdr": 0.01}))
            .unwrap();

        let results = cache
            .get_results("sample1", &["features", "peaks", "summary"], false)
            .unwrap();
        assert_eq!(results["features"], CacheEntry::File(stored));
        assert_eq!(results["peaks"], CacheEntry::Data(CachedData::Table(sample_table())));
        assert_eq!(
            results["summary"],
            CacheEntry::Data(CachedData::Value(json!({"ids": 42, "fdr": 0.01})))
        );
    }

    #[test]
    fn test_missing_tag_is_named_error() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(temp_dir.path()).unwrap();
        cache
            .store_file("s1", "spectra", FileSource::Bytes { bytes: b"x", file_name: "s1.mzML" })
            .unwrap();

        let err = cache.get_results("s1", &["spectra", "never_created"], false).unwrap_err();
        match err {
            CacheError::MissingTag { dataset, tag } => {
                assert_eq!(dataset, "s1");
                assert_eq!(tag, "never_created");
            }
            other => panic!("unexpected error: {other}"),
        }

        let partial = cache.get_results("s1", &["spectra", "never_created"], true).unwrap();
        assert_eq!(partial.len(), 1);
        assert!(cache.get_results("unknown", &["spectra"], false).is_err());
    }

    #[test]
    fn test_restore_overwrites_single_entry() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(temp_dir.path()).unwrap();

        cache.store_value("s1", "score", &json!(1)).unwrap();
        cache.store_value("s1", "score", &json!(2)).unwrap();
        let results = cache.get_results("s1", &["score"], false).unwrap();
        assert_eq!(results["score"], CacheEntry::Data(CachedData::Value(json!(2))));

        cache
            .store_data("s1", "score", &CachedData::Table(sample_table()))
            .unwrap();
        assert!(!temp_dir.path().join("files/s1/score.json.gz").exists());
    }

    #[test]
    fn test_files_with_same_name_keep_their_tags() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(&temp_dir.path().join("cache")).unwrap();

        for (step, tag, content) in [("detect", "features", "FEATURES"), ("search", "ids", "IDS")] {
            let dir = temp_dir.path().join(step);
            fs::create_dir_all(&dir).unwrap();
            let output = dir.join("s1.tsv");
            fs::write(&output, content).unwrap();
            cache
                .store_file("s1", tag, FileSource::Path { path: &output, remove: false })
                .unwrap();
        }

        let results = cache.get_results("s1", &["features", "ids"], false).unwrap();
        let CacheEntry::File(features) = &results["features"] else {
            panic!("features is not a file");
        };
        let CacheEntry::File(ids) = &results["ids"] else {
            panic!("ids is not a file");
        };
        assert_eq!(features.file_name().unwrap(), "features.tsv");
        assert_eq!(fs::read_to_string(features).unwrap(), "FEATURES");
        assert_eq!(fs::read_to_string(ids).unwrap(), "IDS");
    }

    #[test]
    fn test_tags_ignore_ascii_case() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(temp_dir.path()).unwrap();

        cache.store_value("s1", "Score", &json!(1)).unwrap();
        cache.store_value("s1", "score", &json!(2)).unwrap();

        let results = cache.get_results("s1", &["SCORE"], false).unwrap();
        assert_eq!(results["SCORE"], CacheEntry::Data(CachedData::Value(json!(2))));
        assert!(cache.result_exists("s1", "score").unwrap());
        assert_eq!(cache.list_datasets(&["sCoRe"], false).unwrap(), vec!["s1"]);
        assert!(matches!(
            cache.store_value("s1", "ID", &json!(1)),
            Err(CacheError::InvalidTag(_))
        ));
    }

    #[test]
    fn test_latest_write_wins_across_kinds() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(temp_dir.path()).unwrap();

        let file = cache
            .store_file("s1", "x", FileSource::Bytes { bytes: b"raw", file_name: "s1.bin" })
            .unwrap();
        cache.store_value("s1", "x", &json!(2)).unwrap();
        let results = cache.get_results("s1", &["x"], false).unwrap();
        assert_eq!(results["x"], CacheEntry::Data(CachedData::Value(json!(2))));
        assert!(!file.exists());

        let file = cache
            .store_file("s1", "x", FileSource::Bytes { bytes: b"again", file_name: "s1.bin" })
            .unwrap();
        let results = cache.get_results("s1", &["x"], false).unwrap();
        assert_eq!(results["x"], CacheEntry::File(file));
        assert!(!temp_dir.path().join("files/s1/x.json.gz").exists());
        assert_eq!(cache.list_datasets(&["x"], false).unwrap(), vec!["s1"]);
    }

    #[test]
    fn test_list_datasets_by_tags() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(temp_dir.path()).unwrap();

        cache.store_value("a", "ids", &json!([])).unwrap();
        cache
            .store_file("a", "spectra", FileSource::Bytes { bytes: b"", file_name: "a.mzML" })
            .unwrap();
        cache.store_value("b", "ids", &json!([])).unwrap();
        cache
            .store_file("c", "spectra", FileSource::Bytes { bytes: b"", file_name: "c.mzML" })
            .unwrap();

        assert_eq!(cache.list_datasets(&["ids", "spectra"], false).unwrap(), vec!["a"]);
        assert_eq!(
            cache.list_datasets(&["ids", "spectra"], true).unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(cache.list_datasets(&["ids"], false).unwrap(), vec!["a", "b"]);
        assert_eq!(cache.list_datasets(&[], false).unwrap().len(), 3);
        assert!(cache.list_datasets(&["unknown"], false).unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(temp_dir.path()).unwrap();

        cache.store_value("a", "ids", &json!(1)).unwrap();
        cache.store_value("b", "ids", &json!(2)).unwrap();

        cache.remove("a").unwrap();
        assert!(!cache.result_exists("a", "ids").unwrap());
        assert!(cache.result_exists("b", "ids").unwrap());
        assert!(!temp_dir.path().join("files/a").exists());

        cache.clear().unwrap();
        assert!(cache.list_datasets(&[], true).unwrap().is_empty());
        cache.store_value("b", "ids", &json!(3)).unwrap();
        assert!(cache.result_exists("b", "ids").unwrap());
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ResultCache::open(temp_dir.path()).unwrap();

        assert!(matches!(
            cache.store_value("../escape", "ids", &json!(1)),
            Err(CacheError::InvalidDataset(_))
        ));
        assert!(matches!(
            cache.store_value("ok", "id", &json!(1)),
            Err(CacheError::InvalidTag(_))
        ));
        // Quotes in tags are stored as ordinary column names
        cache.store_value("ok", "odd\"tag", &json!(1)).unwrap();
        assert!(cache.result_exists("ok", "odd\"tag").unwrap());
    }
}
