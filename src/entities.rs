//! BIDS filename entities and subject/session labels.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// A BIDS filename split into its key-value entities, suffix and extension.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BidsName {
    pub entities: Vec<(String, String)>,
    pub suffix: String,
    pub extension: String,
}

impl BidsName {
    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Split `sub-1_ses-2_task-rest_run-01_motion.tsv` into entities, suffix and extension.
///
/// Every `_`-separated token but the last is split on its first `-`; the last
/// token is the suffix, with everything from its first `.` as the extension.
pub fn parse_filename(name: &str) -> BidsName {
    let mut tokens: Vec<&str> = name.split('_').collect();
    let last = tokens.pop().unwrap_or_default();

    let (suffix, extension) = match last.find('.') {
        Some(dot) => (&last[..dot], &last[dot..]),
        None => (last, ""),
    };

    let mut entities = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token.split_once('-') {
            Some((k, v)) => entities.push((k.to_string(), v.to_string())),
            None => log::debug!("Ignoring non-entity token {:?} in {}", token, name),
        }
    }

    BidsName {
        entities,
        suffix: suffix.to_string(),
        extension: extension.to_string(),
    }
}

/// Parse the file name component of a path.
pub fn parse_path(path: &Path) -> BidsName {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    parse_filename(name)
}

/// First `sub-*` and `ses-*` directory components of a path (full labels).
pub fn subject_session_from_path(path: &Path) -> (Option<String>, Option<String>) {
    let mut sub = None;
    let mut ses = None;
    for comp in path.components() {
        let part = comp.as_os_str().to_string_lossy();
        if sub.is_none() && part.starts_with("sub-") && !part.contains('_') {
            sub = Some(part.to_string());
        } else if ses.is_none() && part.starts_with("ses-") && !part.contains('_') {
            ses = Some(part.to_string());
        }
    }
    (sub, ses)
}

/// `sub-20812` → `20812`, `ses-1` → `1`; other strings unchanged.
pub fn strip_label_prefix(label: &str) -> &str {
    label
        .strip_prefix("sub-")
        .or_else(|| label.strip_prefix("ses-"))
        .unwrap_or(label)
}

// sub-<digits>_ses-<digits>_acq-<acq>_dir-<dir>_..._epi.json
static FMAP_EPI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*sub-\d+_ses-(?P<ses>\d+)_acq-(?P<acq>\w+)_dir-(?P<dir>\w+)_.*_epi\.json")
        .unwrap()
});

/// Field-map identifier for an EPI sidecar name, e.g.
/// `sub-1_ses-2_acq-dwi_dir-AP_run-01_epi.json` → `fmap_dwi_ap_ses-2`.
pub fn b0_field_identifier(file_name: &str) -> Option<String> {
    let caps = FMAP_EPI_RE.captures(file_name)?;
    Some(format!(
        "fmap_{}_{}_ses-{}",
        &caps["acq"],
        caps["dir"].to_lowercase(),
        &caps["ses"]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_motion_name() {
        let n = parse_filename("sub-20812_ses-1_task-rest_run-01_motion.tsv");
        assert_eq!(n.entity("sub"), Some("20812"));
        assert_eq!(n.entity("ses"), Some("1"));
        assert_eq!(n.entity("task"), Some("rest"));
        assert_eq!(n.entity("run"), Some("01"));
        assert_eq!(n.suffix, "motion");
        assert_eq!(n.extension, ".tsv");
    }

    #[test]
    fn test_parse_double_extension() {
        let n = parse_filename("sub-1_ses-1_echo-2_part-phase_MEGRE.nii.gz");
        assert_eq!(n.suffix, "MEGRE");
        assert_eq!(n.extension, ".nii.gz");
        assert_eq!(n.entities.len(), 4);
    }

    #[test]
    fn test_value_keeps_later_dashes() {
        let n = parse_filename("sub-1_desc-a-b_bold.nii");
        assert_eq!(n.entity("desc"), Some("a-b"));
    }

    #[test]
    fn test_non_entity_token_dropped() {
        let n = parse_filename("sub-1_garbage_T1w.json");
        assert_eq!(n.entities, vec![("sub".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_subject_session_from_path() {
        let p = PathBuf::from("/data/qsirecon/sub-20812/ses-3/dwi/sub-20812_ses-3_bundlestats.csv");
        let (sub, ses) = subject_session_from_path(&p);
        assert_eq!(sub.as_deref(), Some("sub-20812"));
        assert_eq!(ses.as_deref(), Some("ses-3"));
    }

    #[test]
    fn test_strip_label_prefix() {
        assert_eq!(strip_label_prefix("sub-20812"), "20812");
        assert_eq!(strip_label_prefix("ses-1"), "1");
        assert_eq!(strip_label_prefix("20812"), "20812");
    }

    #[test]
    fn test_b0_field_identifier() {
        assert_eq!(
            b0_field_identifier("sub-20812_ses-3_acq-dwi_dir-AP_run-01_epi.json").as_deref(),
            Some("fmap_dwi_ap_ses-3")
        );
        assert_eq!(
            b0_field_identifier("sub-1_ses-2_acq-fmri_dir-PA_run-02_epi.json").as_deref(),
            Some("fmap_fmri_pa_ses-2")
        );
        // Needs a token between dir and the suffix
        assert_eq!(b0_field_identifier("sub-1_ses-2_acq-fmri_dir-PA_epi.json"), None);
        assert_eq!(b0_field_identifier("sub-1_ses-2_T1w.json"), None);
    }
}
