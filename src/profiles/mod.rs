//! Built-in L3 CAT mask presets (spec §4.7), grounded on the reference
//! `profiles.h` table: a handful of named partitioning schemes scaled to
//! the platform's actual way count rather than a fixed literal mask.

use crate::alloc::ClassMask;
use crate::error::{RdtError, Result};

/// A named preset: one mask per class, widest-to-narrowest.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: &'static str,
    pub description: &'static str,
}

pub const BUILTIN_PROFILES: &[Profile] = &[
    Profile {
        name: "equal",
        description: "every class gets an equal, non-overlapping share of the ways",
    },
    Profile {
        name: "overlap",
        description: "every class gets the full mask (no isolation, maximum sharing)",
    },
    Profile {
        name: "isolated",
        description: "class 0 gets a small reserved slice, the remaining classes share the rest",
    },
];

pub fn lookup(name: &str) -> Option<&'static Profile> {
    BUILTIN_PROFILES.iter().find(|p| p.name == name)
}

/// Expands `name` into one mask per class for a platform with `num_ways`
/// ways and `num_classes` classes.
pub fn masks_for(name: &str, num_ways: u32, num_classes: u32) -> Result<Vec<u64>> {
    if num_classes == 0 || num_ways == 0 {
        return Err(RdtError::param("num_classes and num_ways must be non-zero"));
    }
    let full = if num_ways >= 64 { u64::MAX } else { (1u64 << num_ways) - 1 };

    let masks = match name {
        "equal" => {
            let share = (num_ways / num_classes).max(1);
            (0..num_classes)
                .map(|i| {
                    let start = i * share;
                    if start >= num_ways {
                        full
                    } else {
                        let width = share.min(num_ways - start);
                        ((1u64 << width) - 1) << start
                    }
                })
                .collect()
        }
        "overlap" => vec![full; num_classes as usize],
        "isolated" => {
            let reserved_width = (num_ways / 4).max(1).min(num_ways - 1).max(1);
            let reserved = (1u64 << reserved_width) - 1;
            let shared = full & !reserved;
            let mut out = vec![reserved];
            out.extend(std::iter::repeat(shared.max(1)).take(num_classes as usize - 1));
            out
        }
        other => return Err(RdtError::param(format!("unknown profile: {other}"))),
    };
    Ok(masks)
}

/// Validates every mask a profile expands to against the platform's
/// cache-allocation capability, so callers catch a bad preset/capability
/// combination before writing anything.
pub fn validate_for_capability(name: &str, cap: &crate::cap::CaCapability) -> Result<Vec<u64>> {
    let masks = masks_for(name, cap.num_ways, cap.num_classes)?;
    for mask in &masks {
        ClassMask::validate(*mask, cap)?;
    }
    Ok(masks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_profile_splits_ways_without_overlap() {
        let masks = masks_for("equal", 8, 4).unwrap();
        assert_eq!(masks.len(), 4);
        let union = masks.iter().fold(0u64, |acc, m| acc | m);
        assert_eq!(union, 0xFF);
    }

    #[test]
    fn overlap_profile_gives_every_class_the_full_mask() {
        let masks = masks_for("overlap", 8, 3).unwrap();
        assert!(masks.iter().all(|m| *m == 0xFF));
    }

    #[test]
    fn unknown_profile_name_errors() {
        assert!(masks_for("bogus", 8, 4).is_err());
    }

    #[test]
    fn lookup_finds_builtin_by_name() {
        assert!(lookup("equal").is_some());
        assert!(lookup("nonexistent").is_none());
    }
}
