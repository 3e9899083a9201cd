//! Decides which configuration is active and what the managed process
//! should do about it. Nothing in here performs I/O; the controller feeds
//! in what it observed and carries out the returned [`Action`].

use crate::backend::ConfigCatalog;
use crate::backend::store::StoreError;
use crate::backend::types::{ActiveConfig, ProxyProcessState};
use crate::backend::validator::{ValidDocument, ValidationError};
use crate::errors;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    Restart { config_path: PathBuf },
    Stop,
}

/// What the controller found when it looked at the stored subscription
/// document.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionCandidate {
    NotConfigured,
    Missing,
    Unreadable(StoreError),
    Invalid(ValidationError),
    Valid(ValidDocument),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub active: ActiveConfig,
    pub status: String,
    pub preview: String,
}

struct Rejection {
    status: &'static str,
    reason: String,
    preview: String,
}

impl SubscriptionCandidate {
    fn rejection(&self) -> Option<Rejection> {
        match self {
            SubscriptionCandidate::NotConfigured
            | SubscriptionCandidate::Missing
            | SubscriptionCandidate::Valid(_) => None,
            SubscriptionCandidate::Unreadable(error) => Some(Rejection {
                status: errors::active::UNREADABLE,
                reason: error.to_string(),
                preview: errors::active::unreadable_preview(&error.to_string()),
            }),
            SubscriptionCandidate::Invalid(error) => {
                let (status, preview) = match error {
                    ValidationError::Empty => (
                        errors::active::EMPTY_FILE,
                        errors::active::EMPTY_FILE_PREVIEW.to_string(),
                    ),
                    ValidationError::Malformed(parse_error) => (
                        errors::active::INVALID_JSON,
                        errors::active::invalid_json_preview(parse_error),
                    ),
                    ValidationError::NotAnObject => (
                        errors::active::NOT_AN_OBJECT,
                        errors::active::NOT_AN_OBJECT_PREVIEW.to_string(),
                    ),
                    ValidationError::MissingRequiredSections => (
                        errors::active::MISSING_SECTIONS,
                        errors::active::MISSING_SECTIONS_PREVIEW.to_string(),
                    ),
                };
                Some(Rejection {
                    status,
                    reason: error.to_string(),
                    preview,
                })
            }
        }
    }
}

/// Picks the active configuration. A valid subscription document wins over
/// the catalog's current entry; with neither, nothing is active.
pub fn select_active(
    candidate: &SubscriptionCandidate,
    subscription_path: &Path,
    catalog: &dyn ConfigCatalog,
) -> Selection {
    if let SubscriptionCandidate::Valid(document) = candidate {
        return Selection {
            active: ActiveConfig::Subscription {
                path: subscription_path.to_path_buf(),
            },
            status: errors::active::USING_SUBSCRIPTION.to_string(),
            preview: document.pretty().to_string(),
        };
    }

    let rejection = candidate.rejection();

    if let Some((name, index, path)) = current_local_entry(catalog) {
        let status = match &rejection {
            Some(rejection) => errors::active::using_local_after_rejection(&name, &rejection.reason),
            None => errors::active::using_local(&name),
        };
        return Selection {
            active: ActiveConfig::Local { name, index, path },
            status,
            preview: errors::active::LOCAL_PREVIEW.to_string(),
        };
    }

    match rejection {
        Some(rejection) => Selection {
            active: ActiveConfig::Unavailable,
            status: rejection.status.to_string(),
            preview: rejection.preview,
        },
        None => Selection {
            active: ActiveConfig::Unavailable,
            status: errors::active::NONE_AVAILABLE.to_string(),
            preview: errors::active::NONE_AVAILABLE_PREVIEW.to_string(),
        },
    }
}

fn current_local_entry(catalog: &dyn ConfigCatalog) -> Option<(String, usize, PathBuf)> {
    if catalog.count() == 0 {
        return None;
    }
    let index = catalog.current_index()?;
    let path = catalog.current_file_path()?;
    let name = catalog.current_name().unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    Some((name, index, path))
}

/// After a new subscription document was persisted: restart only a running
/// process, and only when what it runs with actually changed.
pub fn plan_after_update(
    changed: bool,
    state: ProxyProcessState,
    config_path: &Path,
) -> Action {
    if changed && state == ProxyProcessState::Running {
        Action::Restart {
            config_path: config_path.to_path_buf(),
        }
    } else {
        Action::None
    }
}

/// After the active selection was recomputed (startup, catalog change,
/// external edit of the stored document).
pub fn plan_for_selection(
    previous: &ActiveConfig,
    next: &ActiveConfig,
    content_changed: bool,
    state: ProxyProcessState,
) -> Action {
    match next.path() {
        None if state.is_active() => Action::Stop,
        None => Action::None,
        Some(path) if state == ProxyProcessState::Running && (previous != next || content_changed) => {
            Action::Restart {
                config_path: path.to_path_buf(),
            }
        }
        Some(_) => Action::None,
    }
}
