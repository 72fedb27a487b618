// src/recipe/license.rs

//! License expressions
//!
//! A recipe declares either a single SPDX identifier or a compound
//! expression:
//!
//! ```toml
//! license = "MIT"
//! license = { all_of = ["GPL-2.0-only", "LGPL-2.1-or-later"] }
//! license = { any_of = ["MIT", { all_of = ["Apache-2.0", "BSD-3-Clause"] }] }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A (possibly compound) license expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum License {
    Single(String),
    AllOf { all_of: Vec<License> },
    AnyOf { any_of: Vec<License> },
}

impl License {
    /// Check the expression is non-empty and every identifier is well-formed
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            License::Single(id) => {
                if id.trim().is_empty() {
                    return Err("empty license identifier".to_string());
                }
                if id.chars().any(char::is_whitespace) {
                    return Err(format!(
                        "license identifier '{id}' contains whitespace; use all_of/any_of"
                    ));
                }
                Ok(())
            }
            License::AllOf { all_of: items } | License::AnyOf { any_of: items } => {
                if items.is_empty() {
                    return Err("empty compound license expression".to_string());
                }
                items.iter().try_for_each(License::validate)
            }
        }
    }

    /// Every SPDX identifier mentioned, in declaration order
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids = Vec::new();
        self.collect(&mut ids);
        ids
    }

    fn collect<'a>(&'a self, ids: &mut Vec<&'a str>) {
        match self {
            License::Single(id) => ids.push(id),
            License::AllOf { all_of: items } | License::AnyOf { any_of: items } => {
                for item in items {
                    item.collect(ids);
                }
            }
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, nested: bool) -> fmt::Result {
        let (items, op) = match self {
            License::Single(id) => return f.write_str(id),
            License::AllOf { all_of } => (all_of, " AND "),
            License::AnyOf { any_of } => (any_of, " OR "),
        };
        let wrap = nested && items.len() > 1;
        if wrap {
            f.write_str("(")?;
        }
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                f.write_str(op)?;
            }
            item.fmt_nested(f, true)?;
        }
        if wrap {
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// SPDX-style rendering: `GPL-2.0-only AND LGPL-2.1-or-later`
impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        license: License,
    }

    fn parse(toml_text: &str) -> License {
        toml::from_str::<Holder>(toml_text).unwrap().license
    }

    #[test]
    fn test_single() {
        let license = parse(r#"license = "MIT""#);
        assert_eq!(license, License::Single("MIT".into()));
        assert_eq!(license.to_string(), "MIT");
        assert!(license.validate().is_ok());
    }

    #[test]
    fn test_all_of() {
        let license = parse(r#"license = { all_of = ["GPL-2.0-only", "LGPL-2.1-or-later"] }"#);
        assert_eq!(license.to_string(), "GPL-2.0-only AND LGPL-2.1-or-later");
        assert_eq!(license.identifiers(), vec!["GPL-2.0-only", "LGPL-2.1-or-later"]);
    }

    #[test]
    fn test_nested_rendering() {
        let license =
            parse(r#"license = { any_of = ["MIT", { all_of = ["Apache-2.0", "BSD-3-Clause"] }] }"#);
        assert_eq!(license.to_string(), "MIT OR (Apache-2.0 AND BSD-3-Clause)");
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(License::Single("  ".into()).validate().is_err());
        assert!(License::AllOf { all_of: vec![] }.validate().is_err());
        assert!(License::Single("GPL 2".into()).validate().is_err());
        let nested = License::AnyOf {
            any_of: vec![License::Single("MIT".into()), License::Single(String::new())],
        };
        assert!(nested.validate().is_err());
    }
}
