use std::collections::HashSet;

use super::types::FarmConfig;
use crate::error::FarmError;

impl FarmConfig {
    /// Validate the config before any worker is started.
    pub fn validate(&self) -> Result<(), FarmError> {
        self.validate_exports()?;
        self.validate_sequence_methods()?;
        self.validate_pool()?;
        Ok(())
    }

    /// At least one export, no duplicates, no empty names.
    fn validate_exports(&self) -> Result<(), FarmError> {
        if self.exported_methods.is_empty() {
            return Err(FarmError::Config(
                "exported_methods must name at least one method".into(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &self.exported_methods {
            if name.trim().is_empty() {
                return Err(FarmError::Config("exported method names must not be empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(FarmError::Config(format!(
                    "method '{name}' is exported more than once"
                )));
            }
        }
        Ok(())
    }

    fn validate_sequence_methods(&self) -> Result<(), FarmError> {
        for name in &self.sequence_methods {
            if !self.exported_methods.contains(name) {
                return Err(FarmError::Config(format!(
                    "sequence method '{name}' is not an exported method"
                )));
            }
        }
        Ok(())
    }

    fn validate_pool(&self) -> Result<(), FarmError> {
        if self.num_workers == 0 {
            return Err(FarmError::Config("num_workers must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(FarmError::Config("max_retries must be at least 1".into()));
        }
        Ok(())
    }
}
