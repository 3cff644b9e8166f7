// File management for workflow steps
//
// Derives the file lists bound to tool arguments: expanding directories,
// rewriting extensions, relocating into result subdirectories and
// collecting lists into one grouped argument. The result cache lives in
// `cache`.

pub mod cache;

pub use cache::{CacheEntry, CachedData, DataTable, FileSource, ResultCache};

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::CacheError;
use crate::executor::ArgItem;
use crate::workflow::layout::WorkflowDir;

/// Length of generated result subdirectory names
const AUTO_DIR_LEN: usize = 4;
const AUTO_DIR_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Where derived files are placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultsDir {
    /// A fresh randomly named subdirectory
    Auto,
    /// A fixed subdirectory, reused across runs
    Named(String),
}

impl ResultsDir {
    /// `""` and `"auto"` select a generated name
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" | "auto" => ResultsDir::Auto,
            name => ResultsDir::Named(name.to_string()),
        }
    }
}

/// Files to derive from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileInput {
    /// A file, or a directory whose entries are used
    Path(PathBuf),
    /// Already resolved items
    Items(Vec<ArgItem>),
}

impl From<&str> for FileInput {
    fn from(path: &str) -> Self {
        FileInput::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for FileInput {
    fn from(path: PathBuf) -> Self {
        FileInput::Path(path)
    }
}

impl From<Vec<ArgItem>> for FileInput {
    fn from(items: Vec<ArgItem>) -> Self {
        FileInput::Items(items)
    }
}

impl From<Vec<String>> for FileInput {
    fn from(paths: Vec<String>) -> Self {
        FileInput::Items(paths.into_iter().map(ArgItem::Single).collect())
    }
}

/// How to derive files from an input
#[derive(Debug, Clone, Default)]
pub struct FileOptions {
    /// New extension, without the dot
    pub file_type: Option<String>,
    /// Relocate into this subdirectory of `results/`
    pub results_dir: Option<ResultsDir>,
    /// Pass all files together as one argument
    pub collect: bool,
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_type(mut self, file_type: &str) -> Self {
        self.file_type = Some(file_type.trim_start_matches('.').to_string());
        self
    }

    pub fn results_dir(mut self, results_dir: ResultsDir) -> Self {
        self.results_dir = Some(results_dir);
        self
    }

    pub fn collect(mut self, collect: bool) -> Self {
        self.collect = collect;
        self
    }
}

/// Path derivation and cache access for one workflow
#[derive(Debug)]
pub struct FileManager {
    layout: WorkflowDir,
    cache: ResultCache,
}

impl FileManager {
    /// Open the file manager, creating the cache if needed
    pub fn new(layout: &WorkflowDir) -> Result<Self, CacheError> {
        Ok(Self {
            layout: layout.clone(),
            cache: ResultCache::open(&layout.cache_dir())?,
        })
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Derive the files for one argument.
    ///
    /// Every item (single or grouped) is transformed the same way: the
    /// extension is replaced, then the file is moved under the results
    /// subdirectory. With `collect`, all resulting paths form one group.
    pub fn get_files(
        &self,
        input: FileInput,
        options: &FileOptions,
    ) -> Result<Vec<ArgItem>, CacheError> {
        let items = match input {
            FileInput::Path(path) => expand_path(&path)?,
            FileInput::Items(items) => items,
        };

        if items.is_empty() {
            return Err(CacheError::NoFiles {
                file_type: options.file_type.clone(),
                results_dir: options.results_dir.as_ref().map(|dir| format!("{:?}", dir)),
            });
        }

        let target_dir = match &options.results_dir {
            Some(results_dir) => Some(self.create_results_subdir(results_dir)?),
            None => None,
        };

        let rewrite = |path: &str| -> String {
            let mut path = PathBuf::from(path);
            if let Some(file_type) = &options.file_type {
                path.set_extension(file_type);
            }
            if let Some(dir) = &target_dir {
                if let Some(name) = path.file_name() {
                    path = dir.join(name);
                }
            }
            path.to_string_lossy().into_owned()
        };

        let items: Vec<ArgItem> = items
            .into_iter()
            .map(|item| match item {
                ArgItem::Single(path) => ArgItem::Single(rewrite(path.as_str())),
                ArgItem::Group(paths) => ArgItem::Group(paths.iter().map(|p| rewrite(p.as_str())).collect()),
            })
            .collect();

        if options.collect {
            let all = items
                .iter()
                .flat_map(|item| item.paths())
                .map(String::from)
                .collect();
            return Ok(vec![ArgItem::Group(all)]);
        }

        Ok(items)
    }

    /// Create (or reuse) a subdirectory of `results/`
    pub fn create_results_subdir(&self, results_dir: &ResultsDir) -> Result<PathBuf, CacheError> {
        let results = self.layout.results_dir();
        let path = match results_dir {
            ResultsDir::Named(name) => results.join(name),
            ResultsDir::Auto => loop {
                let candidate = results.join(random_code(AUTO_DIR_LEN));
                if !candidate.exists() {
                    break candidate;
                }
            },
        };
        std::fs::create_dir_all(&path).map_err(|source| CacheError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// A file stays itself; a directory yields its sorted immediate files
fn expand_path(path: &Path) -> Result<Vec<ArgItem>, CacheError> {
    if !path.is_dir() {
        return Ok(vec![ArgItem::from(path)]);
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() {
            files.push(ArgItem::from(entry.path()));
        }
    }
    Ok(files)
}

fn random_code(len: usize) -> String {
    let mut code = String::with_capacity(len);
    while code.len() < len {
        for byte in uuid::Uuid::new_v4().as_bytes() {
            if code.len() == len {
                break;
            }
            code.push(AUTO_DIR_ALPHABET[*byte as usize % AUTO_DIR_ALPHABET.len()] as char);
        }
    }
    code
}
