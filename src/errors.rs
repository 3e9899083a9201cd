pub mod url {
    pub const EMPTY: &str = "Please enter a subscription URL.";
    pub const HTTP_WARNING: &str =
        "Warning: Using HTTP instead of HTTPS. Data will not be encrypted.";

    pub fn malformed(error: &str) -> String {
        format!("Please enter a valid URL ({})", error)
    }

    pub fn unsupported_scheme(scheme: &str) -> String {
        format!(
            "Unsupported URL scheme '{}'. Only http and https subscriptions are supported.",
            scheme
        )
    }

    pub fn stored_value_invalid(value: &str, error: &str) -> String {
        format!("Ignoring stored subscription URL '{}': {}", value, error)
    }
}

pub mod subscription {
    pub const NOT_CONFIGURED: &str = "No subscription configured";
    pub const NO_URL_FOR_UPDATE: &str = "No subscription URL configured.";
    pub const SAVING: &str = "Saving URL and fetching config...";
    pub const MANUAL_UPDATE: &str = "Manually updating config...";
    pub const DOWNLOADING: &str = "Downloading config from subscription...";
    pub const SAVED: &str = "Subscription URL saved successfully!";

    pub fn loaded(active: &str) -> String {
        format!("Subscription URL loaded ({}). Fetching config...", active)
    }

    pub fn updated(timestamp: &str) -> String {
        format!("Config updated successfully. Last update: {}", timestamp)
    }

    pub fn unchanged(timestamp: &str) -> String {
        format!("Config unchanged. Last check: {}", timestamp)
    }

    pub fn download_failed(error: &str) -> String {
        format!("Error downloading config: {}", error)
    }

    pub fn download_failed_preview(error: &str) -> String {
        format!("Download Error: {}", error)
    }

    pub fn tls_failed(error: &str, diagnostics: &str) -> String {
        format!("TLS Error: {}. {}", error, diagnostics)
    }

    pub fn tls_failed_preview(error: &str, diagnostics: &str) -> String {
        format!("TLS Error: {}\n\nTroubleshooting:\n{}", error, diagnostics)
    }

    pub const EMPTY: &str = "Error: Empty config received";
    pub const EMPTY_PREVIEW: &str = "Error: Empty config received from subscription URL";

    pub fn malformed(parse_error: &str) -> String {
        format!(
            "Error: Downloaded config is not valid JSON ({})",
            parse_error
        )
    }

    pub fn malformed_preview(parse_error: &str, raw: &str) -> String {
        format!(
            "Error: Invalid JSON downloaded.\nParse error: {}\n\nRaw content:\n{}",
            parse_error, raw
        )
    }

    pub const NOT_AN_OBJECT: &str = "Error: Downloaded config is not a JSON object";
    pub const NOT_AN_OBJECT_PREVIEW: &str = "Error: Downloaded config is not a valid JSON object";
    pub const MISSING_SECTIONS: &str =
        "Error: Downloaded config missing required sections (inbounds/outbounds)";
    pub const MISSING_SECTIONS_PREVIEW: &str = "Error: Downloaded configuration is missing required 'inbounds' or 'outbounds' sections.\nThis doesn't appear to be a valid sing-box configuration.";

    pub fn save_failed(error: &str) -> String {
        format!("Error: Failed to save config file ({})", error)
    }
}

pub mod active {
    pub const USING_SUBSCRIPTION: &str = "Status: Using subscription config";
    pub const NONE_AVAILABLE: &str = "Status: No configuration available";
    pub const NONE_AVAILABLE_PREVIEW: &str = "No configuration available.\nPlease enter a subscription URL or import a configuration file.";
    pub const LOCAL_PREVIEW: &str = "Using local configuration file";
    pub const EMPTY_FILE: &str = "Status: Empty config file";
    pub const INVALID_JSON: &str = "Status: Invalid JSON config";
    pub const NOT_AN_OBJECT: &str = "Status: Invalid config - not a JSON object";
    pub const MISSING_SECTIONS: &str = "Status: Invalid config - missing inbounds/outbounds";
    pub const UNREADABLE: &str = "Status: Cannot read config file";

    pub const EMPTY_FILE_PREVIEW: &str = "Error: Configuration file is empty";
    pub const NOT_AN_OBJECT_PREVIEW: &str =
        "Error: Configuration appears to be invalid.\nThe top-level value is not a JSON object.";
    pub const MISSING_SECTIONS_PREVIEW: &str = "Error: Configuration appears to be invalid.\nMissing required 'inbounds' or 'outbounds' sections.";

    pub fn invalid_json_preview(parse_error: &str) -> String {
        format!(
            "Error: Invalid JSON configuration.\nParse error: {}",
            parse_error
        )
    }

    pub fn unreadable_preview(error: &str) -> String {
        format!("Error: Cannot read configuration file ({})", error)
    }

    pub fn using_local(name: &str) -> String {
        format!("Status: Using local config: {}", name)
    }

    pub fn using_local_after_rejection(name: &str, reason: &str) -> String {
        format!(
            "Status: Using local config: {} (subscription config rejected: {})",
            name, reason
        )
    }
}

pub mod store {
    pub fn failed_to_read(path: &str) -> String {
        format!("Failed to read config from {}", path)
    }

    pub fn failed_to_create_dir(path: &str) -> String {
        format!("Failed to create config directory: {}", path)
    }

    pub fn failed_to_write_temp(path: &str) -> String {
        format!("Failed to write temporary config to {}", path)
    }

    pub fn failed_to_rename(from: &str, to: &str) -> String {
        format!("Failed to rename {} to {}", from, to)
    }

    #[cfg(unix)]
    pub const FAILED_TO_FSYNC: &str = "Failed to fsync temp file";
    pub const FAILED_TO_CREATE_WATCHER: &str = "Failed to create file watcher";

    pub fn failed_to_watch(path: &str) -> String {
        format!("Failed to watch config directory: {}", path)
    }
}

pub mod settings {
    pub fn corrupted(path: &str, backup_path: &str, error: &str) -> String {
        format!(
            "Settings file {} was corrupted and has been reset. Backup saved to {}. Error: {}",
            path, backup_path, error
        )
    }

    pub fn failed_to_read(path: &str) -> String {
        format!("Failed to read settings from {}", path)
    }

    pub fn failed_to_write(path: &str) -> String {
        format!("Failed to write settings to {}", path)
    }

    pub const FAILED_TO_SERIALIZE: &str = "Failed to serialize settings to YAML";
}

pub mod catalog {
    pub fn index_out_of_range(index: usize, count: usize) -> String {
        format!(
            "Local config index {} is out of range ({} configs available)",
            index, count
        )
    }

    pub fn failed_to_scan(path: &str) -> String {
        format!("Failed to scan local config directory {}", path)
    }

    pub fn import_rejected(path: &str, error: &str) -> String {
        format!("Refusing to import {}: {}", path, error)
    }

    pub fn import_name_missing(path: &str) -> String {
        format!("Cannot derive a config name from {}", path)
    }
}

pub mod binary {
    pub fn not_found(path: &str) -> String {
        format!(
            "sing-box binary not found at path: {}. Please check the binary path configuration or use --singbox-path flag.",
            path
        )
    }

    pub fn not_found_simple(path: &str) -> String {
        format!(
            "sing-box binary not found at {}. Please verify the binary path.",
            path
        )
    }

    pub fn permission_denied(path: &str) -> String {
        format!(
            "Permission denied executing sing-box binary at {}. Check file permissions.",
            path
        )
    }
}

pub mod disk {
    pub const FULL: &str =
        "Disk space exhausted. Cannot save configuration. Free up disk space and try again.";

    pub fn full_log_write(path: &str) -> String {
        format!("Disk full - cannot write to log file: {}", path)
    }
}

pub mod logs {
    pub const FAILED_TO_CREATE_DIR: &str = "Failed to create log directory";
    pub const FAILED_TO_CREATE_FILE: &str = "Failed to create log file";

    pub fn failed_to_write(error: &str) -> String {
        format!("Failed to write process output to log: {}", error)
    }

    pub fn failed_to_flush(error: &str) -> String {
        format!("Failed to flush log file: {}", error)
    }

    pub fn retention_invalid(days: u32) -> String {
        format!(
            "Log retention days must be between 1 and 3650 (10 years), got: {}",
            days
        )
    }
}

pub mod process {
    pub const PORT_IN_USE: &str =
        "Port is already in use. Another proxy may already be bound to the configured inbound.";
    pub const ALREADY_RUNNING: &str = "sing-box is already running. Stop it before starting again.";
    pub const NOT_RUNNING: &str = "sing-box is not running";
    pub const ALREADY_STOPPING: &str = "sing-box is already stopping";
    pub const NO_CONFIGURATION: &str = "No configuration available to start sing-box with";

    pub fn spawn_failed(error: &str) -> String {
        format!("Failed to spawn sing-box process: {}", error)
    }

    pub fn restart_failed(error: &str) -> String {
        format!("Error: Failed to restart sing-box with the new config ({})", error)
    }

    pub const FAILED_TO_CAPTURE_STDOUT: &str = "Failed to capture stdout";
    pub const FAILED_TO_CAPTURE_STDERR: &str = "Failed to capture stderr";
}
