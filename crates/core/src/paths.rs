use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".conclave"))
            .unwrap_or_else(|| PathBuf::from(".conclave"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn memory_db(&self) -> PathBuf {
        self.data_dir().join("memory.db")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
