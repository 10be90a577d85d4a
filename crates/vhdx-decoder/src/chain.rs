//! Differencing disk parent resolution
//!
//! Candidate paths come from the parent locator. A candidate is accepted
//! once it decodes and its DataWriteGuid matches the locator's linkage.
//! Failures here never fail the child: they become the terminal
//! [`ParentLink::Unresolved`] marker.

use crate::image::{decode_file, DecodeOptions, ParentLink};
use crate::layout::VHDX_PARENT_LOCATOR_TYPE;
use crate::metadata::ParentLocator;
use std::collections::HashSet;
use std::path::{Path, PathBuf, MAIN_SEPARATOR_STR};
use vhdx_core::{ChainError, ParentAttempt};

/// Paths to try for the parent of `child_path`, in order, without duplicates.
///
/// Each locator path is tried relative to the child's directory first, then
/// as written.
pub fn candidate_paths(child_path: &Path, locator: &ParentLocator) -> Vec<PathBuf> {
    let child_dir = child_path.parent().unwrap_or_else(|| Path::new(""));
    let mut candidates: Vec<PathBuf> = Vec::new();

    for hint in locator.path_hints() {
        let given = PathBuf::from(hint.replace('\\', MAIN_SEPARATOR_STR));
        for candidate in [child_dir.join(&given), given] {
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }
    candidates
}

/// Locate, decode and verify the parent of the image at `child_path`.
///
/// `visited` holds the canonical paths already on the chain. It is only
/// extended with the paths of a parent that was accepted.
pub fn resolve_parent(
    child_path: &Path,
    locator: &ParentLocator,
    options: &DecodeOptions,
    visited: &mut HashSet<PathBuf>,
) -> ParentLink {
    if locator.locator_type != VHDX_PARENT_LOCATOR_TYPE {
        return unresolved(ChainError::UnsupportedLocator {
            locator_type: locator.locator_type,
        });
    }
    if visited.len() > options.max_chain_depth {
        return unresolved(ChainError::ChainTooDeep {
            limit: options.max_chain_depth,
        });
    }

    let expected: Vec<_> = [locator.parent_linkage(), locator.parent_linkage2()]
        .into_iter()
        .flatten()
        .collect();
    let mut attempts = Vec::new();
    let mut cycle = None;
    let mut reject = |path: &Path, reason: String| {
        tracing::warn!("parent candidate {} rejected: {}", path.display(), reason);
        attempts.push(ParentAttempt {
            path: path.to_path_buf(),
            reason,
        });
    };

    for candidate in candidate_paths(child_path, locator) {
        if !candidate.exists() {
            reject(&candidate, "does not exist".to_string());
            continue;
        }
        let canonical = match candidate.canonicalize() {
            Ok(canonical) => canonical,
            Err(e) => {
                reject(&candidate, format!("cannot resolve path: {}", e));
                continue;
            }
        };
        if visited.contains(&canonical) {
            reject(&canonical, "already on the parent chain".to_string());
            cycle.get_or_insert(canonical);
            continue;
        }

        let mut chain = visited.clone();
        chain.insert(canonical.clone());
        let parent = match decode_file(&canonical, options, &mut chain) {
            Ok(parent) => parent,
            Err(e) => {
                reject(&canonical, format!("decode failed: {}", e));
                continue;
            }
        };

        let data_write_guid = parent.headers.active.header.data_write_guid;
        if expected.is_empty() {
            tracing::warn!(
                "parent locator has no linkage; accepting {} unverified",
                canonical.display()
            );
        } else if !expected.contains(&data_write_guid) {
            reject(
                &canonical,
                format!(
                    "linkage mismatch: DataWriteGuid {} is not {}",
                    data_write_guid,
                    expected
                        .iter()
                        .map(|guid| guid.to_string())
                        .collect::<Vec<_>>()
                        .join(" or ")
                ),
            );
            continue;
        }

        tracing::info!("parent located at {}", canonical.display());
        *visited = chain;
        return ParentLink::Decoded(Box::new(parent));
    }

    match cycle {
        Some(path) => unresolved(ChainError::ParentCycleDetected { path }),
        None => unresolved(ChainError::ParentNotFound { attempts }),
    }
}

fn unresolved(error: ChainError) -> ParentLink {
    tracing::warn!("parent chain unresolved: {}", error);
    ParentLink::Unresolved(error)
}
