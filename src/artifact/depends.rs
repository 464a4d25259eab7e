//! Depends/provides matching

use super::{Depends, KEY_DEVICE_TYPE, Provides};
use crate::{Error, Result};

/// Check every artifact depend against the installed provides
///
/// `device_type` is skipped; callers compare it against the device's own
/// type.
///
/// # Errors
///
/// Returns `Dependency` naming the first key that is missing or mismatched
pub fn verify_dependencies(depends: &Depends, provides: &Provides) -> Result<()> {
    for (key, wanted) in depends {
        if key == KEY_DEVICE_TYPE {
            continue;
        }

        let Some(installed) = provides.get(key) else {
            return Err(Error::Dependency(format!(
                "artifact dependency {key:?} not satisfied by currently installed artifact (key not provided)"
            )));
        };

        if !wanted.accepts(installed) {
            return Err(Error::Dependency(format!(
                "artifact dependency {key:?} not satisfied by currently installed artifact ({wanted} != {installed})"
            )));
        }
    }

    Ok(())
}

/// Whether a clears-provides `pattern` matches `key`
///
/// `*` matches any run of characters, everything else is literal.
#[must_use]
pub fn clears_key(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = key.strip_prefix(first) else {
        return false;
    };

    let (last, middle) = rest.split_last().map_or(("", &[][..]), |(l, m)| (*l, m));
    for part in middle {
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }

    remaining.len() >= last.len() && remaining.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::DependValue;

    fn provides(pairs: &[(&str, &str)]) -> Provides {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn satisfied_scalar_and_list() {
        let mut depends = Depends::new();
        depends.insert("rdfm.software.supports_rsync".into(), DependValue::One("true".into()));
        depends.insert(
            "artifact_name".into(),
            DependValue::Many(vec!["v1".into(), "v2".into()]),
        );
        depends.insert("device_type".into(), DependValue::Many(vec!["other".into()]));

        let installed = provides(&[("artifact_name", "v2"), ("rdfm.software.supports_rsync", "true")]);
        verify_dependencies(&depends, &installed).unwrap();
    }

    #[test]
    fn mismatch_names_the_key() {
        let mut depends = Depends::new();
        depends.insert("rootfs-image.checksum".into(), DependValue::One("abc".into()));

        let err = verify_dependencies(&depends, &provides(&[("rootfs-image.checksum", "def")]))
            .unwrap_err()
            .to_string();
        assert!(err.contains("\"rootfs-image.checksum\""));
        assert!(err.contains("abc != def"));

        let err = verify_dependencies(&depends, &Provides::new()).unwrap_err().to_string();
        assert!(err.contains("key not provided"));
    }

    #[test]
    fn glob_matching() {
        assert!(clears_key("rootfs-image.*", "rootfs-image.checksum"));
        assert!(clears_key("*", "anything"));
        assert!(clears_key("a*c*e", "abcde"));
        assert!(!clears_key("a*c*e", "abcd"));
        assert!(clears_key("exact", "exact"));
        assert!(!clears_key("exact", "exactly"));
        assert!(!clears_key("ab*ba", "aba"));
    }
}
