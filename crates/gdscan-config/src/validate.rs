//! Configuration validation

use crate::{ConfigError, Result, ScanConfig};

impl ScanConfig {
    /// Check ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;

        if pipeline.idle_timeout_ms == 0 {
            return Err(invalid("pipeline.idle_timeout_ms", "must be greater than zero"));
        }
        if pipeline.fence_timeout_ms == 0 {
            return Err(invalid("pipeline.fence_timeout_ms", "must be greater than zero"));
        }
        if pipeline.max_file_size == 0 {
            return Err(invalid("pipeline.max_file_size", "must be greater than zero"));
        }
        if pipeline.allocation_escalation_threshold == 0 {
            return Err(invalid(
                "pipeline.allocation_escalation_threshold",
                "must be at least 1",
            ));
        }
        if pipeline.execution_revalidate_threshold == 0 {
            return Err(invalid(
                "pipeline.execution_revalidate_threshold",
                "must be at least 1",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
