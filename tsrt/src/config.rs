//! Run-time configuration, read from `TSD_*` environment variables.

use std::{env, error::Error, path::PathBuf};

/// The default size of one machine code block in bytes.
const DEFAULT_CODE_BLOCK_SIZE: usize = 65536;
/// The default number of machine code blocks in the executable arena.
const DEFAULT_CODE_BLOCKS: usize = 256;
/// How often a single merge point may be generalized before specialization gives up.
const DEFAULT_MERGE_LIMIT: usize = 64;

#[derive(Clone, Debug)]
pub struct Config {
    /// The size of each machine code block handed to a builder.
    pub(crate) code_block_size: usize,
    /// The total size of the executable arena blocks are carved from.
    pub(crate) code_arena_size: usize,
    /// How many times one (merge point, green key) pair may be generalized.
    pub(crate) merge_limit: usize,
    /// If `Some`, the file generated machine code is dumped to.
    pub(crate) code_dump: Option<PathBuf>,
}

impl Config {
    /// Build a configuration from `TSD_CODE_BLOCK_SIZE`, `TSD_CODE_ARENA_SIZE`,
    /// `TSD_MERGE_LIMIT`, and `TSD_CODE_DUMP`, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut config = Self::default();
        if let Some(x) = parse_usize("TSD_CODE_BLOCK_SIZE")? {
            config = config.with_code_block_size(x)?;
        }
        if let Some(x) = parse_usize("TSD_CODE_ARENA_SIZE")? {
            config = config.with_code_arena_size(x)?;
        }
        if let Some(x) = parse_usize("TSD_MERGE_LIMIT")? {
            config = config.with_merge_limit(x);
        }
        if let Ok(p) = env::var("TSD_CODE_DUMP") {
            if !p.is_empty() {
                config = config.with_code_dump(PathBuf::from(p));
            }
        }
        Ok(config)
    }

    pub fn with_code_block_size(mut self, size: usize) -> Result<Self, Box<dyn Error>> {
        // A flexswitch needs room for at least a handful of cases plus its overflow jump.
        if size < 256 {
            return Err(format!("Code block size {size} is too small (minimum 256)").into());
        }
        self.code_block_size = size;
        if self.code_arena_size < size {
            self.code_arena_size = size;
        }
        Ok(self)
    }

    pub fn with_code_arena_size(mut self, size: usize) -> Result<Self, Box<dyn Error>> {
        if size < self.code_block_size {
            return Err(format!(
                "Code arena size {size} is smaller than the code block size {}",
                self.code_block_size
            )
            .into());
        }
        self.code_arena_size = size;
        Ok(self)
    }

    pub fn with_merge_limit(mut self, limit: usize) -> Self {
        self.merge_limit = limit;
        self
    }

    pub fn with_code_dump(mut self, path: PathBuf) -> Self {
        self.code_dump = Some(path);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            code_block_size: DEFAULT_CODE_BLOCK_SIZE,
            code_arena_size: DEFAULT_CODE_BLOCK_SIZE * DEFAULT_CODE_BLOCKS,
            merge_limit: DEFAULT_MERGE_LIMIT,
            code_dump: None,
        }
    }
}

fn parse_usize(var: &str) -> Result<Option<usize>, Box<dyn Error>> {
    match env::var(var) {
        Ok(s) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|e| format!("Invalid {var} value '{s}': {e}").into()),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters() {
        let c = Config::default().with_code_block_size(4096).unwrap();
        assert_eq!(c.code_block_size, 4096);
        assert!(c.code_arena_size >= 4096);
        assert!(Config::default().with_code_block_size(16).is_err());
        assert!(Config::default()
            .with_code_arena_size(DEFAULT_CODE_BLOCK_SIZE - 1)
            .is_err());
        assert_eq!(Config::default().with_merge_limit(3).merge_limit, 3);
    }
}
