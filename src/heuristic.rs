//! Scanner sequence → BIDS target classification (HeuDiConv heuristic).
//!
//! Input is the `dicominfo.tsv` HeuDiConv writes in its first pass; each row
//! describes one DICOM series.

use std::collections::BTreeMap;
use std::path::Path;

use crate::table::{self, Table, TableError};

/// The fields of a `dicominfo.tsv` row the heuristic looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeqInfo {
    pub series_id: String,
    pub protocol_name: String,
    pub series_description: String,
    pub dim1: u32,
    pub dim2: u32,
    pub dim3: u32,
    pub image_type: Vec<String>,
}

/// `('ORIGINAL', 'PRIMARY', 'M', 'NORM')` or `["ORIGINAL", "PRIMARY"]` or
/// `ORIGINAL\PRIMARY` → `[ORIGINAL, PRIMARY, ...]`.
pub fn parse_image_type(raw: &str) -> Vec<String> {
    let inner = raw
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    inner
        .split([',', '\\'])
        .map(|s| s.trim().trim_matches(['\'', '"']).trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn dim(table: &Table, row: usize, name: &str) -> u32 {
    table
        .cell(row, name)
        .and_then(table::parse_number)
        .map(|v| v as u32)
        .unwrap_or(0)
}

impl SeqInfo {
    /// Read every row of a `dicominfo.tsv`.
    pub fn read_dicominfo(path: &Path) -> Result<Vec<SeqInfo>, TableError> {
        let t = Table::read(path)?;
        for required in ["series_id", "protocol_name"] {
            if !t.has_column(required) {
                return Err(TableError::MissingColumn(required.to_string()));
            }
        }
        let text = |row: usize, name: &str| t.cell(row, name).unwrap_or_default().to_string();

        Ok((0..t.len())
            .map(|row| SeqInfo {
                series_id: text(row, "series_id"),
                protocol_name: text(row, "protocol_name"),
                series_description: text(row, "series_description"),
                dim1: dim(&t, row, "dim1"),
                dim2: dim(&t, row, "dim2"),
                dim3: dim(&t, row, "dim3"),
                image_type: parse_image_type(t.cell(row, "image_type").unwrap_or_default()),
            })
            .collect())
    }

    fn dims(&self) -> (u32, u32, u32) {
        (self.dim1, self.dim2, self.dim3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BidsTarget {
    T1wNorm,
    T2w,
    T2wNorm,
    DwiFmapAp,
    DwiFmapPa,
    Dwi,
    FmriFmapAp,
    FmriFmapPa,
    FuncNback,
    FuncRest,
    Asl,
    AslM0,
    Qsm,
}

impl BidsTarget {
    pub const ALL: [BidsTarget; 13] = [
        Self::T1wNorm,
        Self::T2w,
        Self::T2wNorm,
        Self::DwiFmapAp,
        Self::DwiFmapPa,
        Self::Dwi,
        Self::FmriFmapAp,
        Self::FmriFmapPa,
        Self::FuncNback,
        Self::FuncRest,
        Self::Asl,
        Self::AslM0,
        Self::Qsm,
    ];

    /// HeuDiConv output template for this target.
    pub fn template(&self) -> &'static str {
        match self {
            Self::T1wNorm => "{bids_subject_session_dir}/anat/{bids_subject_session_prefix}_run-{item:02d}_rec-norm_T1w",
            Self::T2w => "{bids_subject_session_dir}/anat/{bids_subject_session_prefix}_run-{item:02d}_T2w",
            Self::T2wNorm => "{bids_subject_session_dir}/anat/{bids_subject_session_prefix}_run-{item:02d}_rec-norm_T2w",
            Self::Dwi => "{bids_subject_session_dir}/dwi/{bids_subject_session_prefix}_run-{item:02d}_dwi",
            Self::Asl => "{bids_subject_session_dir}/perf/{bids_subject_session_prefix}_run-{item:02d}_asl",
            Self::AslM0 => "{bids_subject_session_dir}/perf/{bids_subject_session_prefix}_run-{item:02d}_m0scan",
            Self::Qsm => "{bids_subject_session_dir}/swi/{bids_subject_session_prefix}_run-{item:02d}_qsm",
            Self::FuncNback => "{bids_subject_session_dir}/func/{bids_subject_session_prefix}_task-nback_run-{item:02d}_bold",
            Self::FuncRest => "{bids_subject_session_dir}/func/{bids_subject_session_prefix}_task-rest_run-{item:02d}_bold",
            Self::DwiFmapAp => "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_acq-dwi_dir-AP_run-{item:02d}_epi",
            Self::DwiFmapPa => "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_acq-dwi_dir-PA_run-{item:02d}_epi",
            Self::FmriFmapAp => "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_acq-fmri_dir-AP_run-{item:02d}_epi",
            Self::FmriFmapPa => "{bids_subject_session_dir}/fmap/{bids_subject_session_prefix}_acq-fmri_dir-PA_run-{item:02d}_epi",
        }
    }
}

/// Assign a series to a BIDS target. First match wins.
pub fn classify(s: &SeqInfo) -> Option<BidsTarget> {
    let p = s.protocol_name.as_str();
    let anat_dims = s.dim1 == 256 && s.dim2 == 256 && (s.dim3 == 352 || s.dim3 == 176);

    // Tier 1: T1w (not the setter scout)
    if (p.contains("anat_t1w") || p.contains("anat_T1w") || p.contains("ABCD_T1w_MPR_vNav"))
        && !p.contains("setter")
        && anat_dims
    {
        return Some(BidsTarget::T1wNorm);
    }

    // Tier 2: T2w, split on the NORM image type
    if (p.contains("anat_t2w") || p.contains("anat_T2w") || p.contains("ABCD_T2w_SPC_vNav"))
        && !p.contains("setter")
        && anat_dims
    {
        if s.image_type.iter().any(|t| t == "NORM") {
            return Some(BidsTarget::T2wNorm);
        }
        return Some(BidsTarget::T2w);
    }

    // Tier 3: diffusion. The dims only gate the ABCD name.
    if p == "dwi_acq-multishell_dir-AP_dwi" || (p == "ABCD_dMRI" && s.dims() == (140, 140, 81)) {
        return Some(BidsTarget::Dwi);
    }

    // Tier 4: diffusion distortion maps
    if p == "fmap_acq-dMRIdistmap_dir-AP_epi" || p == "ABCD_dMRI_DistortionMap_AP" {
        return Some(BidsTarget::DwiFmapAp);
    }
    if p == "fmap_acq-dMRIdistmap_dir-PA_epi" || p == "ABCD_dMRI_DistortionMap_PA" {
        return Some(BidsTarget::DwiFmapPa);
    }

    let func_dims = s.dims() == (90, 90, 60);

    // Tier 5: resting state
    if p.contains("rest") && func_dims {
        return Some(BidsTarget::FuncRest);
    }

    // Tier 6: n-back. The dims only gate the hyphenated name.
    if p.contains("fracnoback") || (p.contains("frac-no-back") && func_dims) {
        return Some(BidsTarget::FuncNback);
    }

    // Tier 7: fMRI distortion maps
    if matches!(p, "ABCD_fMRI_DistortionMap_AP" | "fmap_acq-fMRIdistmap_dir-AP_epi") {
        return Some(BidsTarget::FmriFmapAp);
    }
    if matches!(p, "ABCD_fMRI_DistortionMap_PA" | "fmap_acq-fMRIdistmap_dir-PA_epi") {
        return Some(BidsTarget::FmriFmapPa);
    }

    // Tier 8: ASL, matched on series description
    let d = s.series_description.as_str();
    if matches!(d, "asl_acq-3dspiralv20unbalanced_asl_ASL" | "ASL_3DSPIRAL_V20_GE_UnBalanced_ASL") {
        return Some(BidsTarget::Asl);
    }
    if matches!(d, "asl_acq-3dspiralv20unbalanced_asl_M0" | "ASL_3DSPIRAL_V20_GE_UnBalanced_M0") {
        return Some(BidsTarget::AslM0);
    }

    // Tier 9: QSM
    if p == "qsm_acq-1.5mm_GRE" || (p.contains("QSM_SWI") && s.dims() == (160, 120, 384)) {
        return Some(BidsTarget::Qsm);
    }

    None
}

/// Series IDs per target. Every target is present, possibly with no series.
pub fn infotodict(seqs: &[SeqInfo]) -> BTreeMap<BidsTarget, Vec<String>> {
    let mut info: BTreeMap<BidsTarget, Vec<String>> =
        BidsTarget::ALL.iter().map(|t| (*t, Vec::new())).collect();
    for s in seqs {
        match classify(s) {
            Some(target) => info.entry(target).or_default().push(s.series_id.clone()),
            None => log::debug!("Unmatched series {} ({})", s.series_id, s.protocol_name),
        }
    }
    info
}

/// One row per series: `series_id, protocol_name, series_description, template`.
/// Unmatched series get a blank template.
pub fn assignments_table(seqs: &[SeqInfo]) -> Table {
    let mut t = Table::new(
        ["series_id", "protocol_name", "series_description", "template"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    for s in seqs {
        t.rows.push(vec![
            s.series_id.clone(),
            s.protocol_name.clone(),
            s.series_description.clone(),
            classify(s).map(|c| c.template().to_string()).unwrap_or_default(),
        ]);
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(protocol: &str, dims: (u32, u32, u32)) -> SeqInfo {
        SeqInfo {
            series_id: "1-x".to_string(),
            protocol_name: protocol.to_string(),
            dim1: dims.0,
            dim2: dims.1,
            dim3: dims.2,
            ..Default::default()
        }
    }

    #[test]
    fn tier1_t1w_needs_dims_and_no_setter() {
        assert_eq!(classify(&seq("ABCD_T1w_MPR_vNav", (256, 256, 176))), Some(BidsTarget::T1wNorm));
        assert_eq!(classify(&seq("anat_T1w", (256, 256, 352))), Some(BidsTarget::T1wNorm));
        assert_eq!(classify(&seq("ABCD_T1w_MPR_vNav_setter", (256, 256, 176))), None);
        assert_eq!(classify(&seq("anat_T1w", (256, 256, 100))), None);
    }

    #[test]
    fn tier2_t2w_norm_split() {
        let mut s = seq("ABCD_T2w_SPC_vNav", (256, 256, 176));
        assert_eq!(classify(&s), Some(BidsTarget::T2w));
        s.image_type = parse_image_type("('ORIGINAL', 'PRIMARY', 'M', 'NORM')");
        assert_eq!(classify(&s), Some(BidsTarget::T2wNorm));
    }

    #[test]
    fn tier3_dwi_precedence() {
        // Multishell name matches on any dims
        assert_eq!(classify(&seq("dwi_acq-multishell_dir-AP_dwi", (1, 1, 1))), Some(BidsTarget::Dwi));
        assert_eq!(classify(&seq("ABCD_dMRI", (140, 140, 81))), Some(BidsTarget::Dwi));
        assert_eq!(classify(&seq("ABCD_dMRI", (140, 140, 80))), None);
    }

    #[test]
    fn tier6_nback_precedence() {
        assert_eq!(classify(&seq("fMRI_fracnoback", (64, 64, 30))), Some(BidsTarget::FuncNback));
        assert_eq!(classify(&seq("func_frac-no-back", (90, 90, 60))), Some(BidsTarget::FuncNback));
        assert_eq!(classify(&seq("func_frac-no-back", (64, 64, 30))), None);
    }

    #[test]
    fn rest_needs_dims() {
        assert_eq!(classify(&seq("fMRI_rest", (90, 90, 60))), Some(BidsTarget::FuncRest));
        assert_eq!(classify(&seq("fMRI_rest", (64, 64, 60))), None);
    }

    #[test]
    fn fmaps_and_asl() {
        assert_eq!(classify(&seq("ABCD_dMRI_DistortionMap_PA", (0, 0, 0))), Some(BidsTarget::DwiFmapPa));
        assert_eq!(classify(&seq("fmap_acq-fMRIdistmap_dir-AP_epi", (0, 0, 0))), Some(BidsTarget::FmriFmapAp));
        let mut s = seq("whatever", (0, 0, 0));
        s.series_description = "ASL_3DSPIRAL_V20_GE_UnBalanced_M0".to_string();
        assert_eq!(classify(&s), Some(BidsTarget::AslM0));
    }

    #[test]
    fn qsm_rules() {
        assert_eq!(classify(&seq("qsm_acq-1.5mm_GRE", (0, 0, 0))), Some(BidsTarget::Qsm));
        assert_eq!(classify(&seq("QSM_SWI_x", (160, 120, 384))), Some(BidsTarget::Qsm));
        assert_eq!(classify(&seq("QSM_SWI_x", (160, 120, 100))), None);
    }

    #[test]
    fn test_infotodict_has_every_target() {
        let seqs = vec![seq("ABCD_dMRI", (140, 140, 81)), seq("localizer", (0, 0, 0))];
        let info = infotodict(&seqs);
        assert_eq!(info.len(), BidsTarget::ALL.len());
        assert_eq!(info[&BidsTarget::Dwi], vec!["1-x".to_string()]);
        assert!(info[&BidsTarget::T1wNorm].is_empty());
    }

    #[test]
    fn test_parse_image_type_variants() {
        assert_eq!(parse_image_type("['ORIGINAL', 'PRIMARY']"), vec!["ORIGINAL", "PRIMARY"]);
        assert_eq!(parse_image_type("ORIGINAL\\PRIMARY\\M"), vec!["ORIGINAL", "PRIMARY", "M"]);
        assert!(parse_image_type("").is_empty());
    }

    #[test]
    fn test_read_dicominfo() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = dir.path().join("dicominfo.tsv");
        std::fs::write(
            &p,
            "series_id\tdim1\tdim2\tdim3\tprotocol_name\tseries_description\timage_type\n\
             5-ABCD_dMRI\t140\t140\t81\tABCD_dMRI\tABCD_dMRI\t('ORIGINAL', 'PRIMARY')\n",
        )
        .unwrap();
        let seqs = SeqInfo::read_dicominfo(&p).unwrap();
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].dim3, 81);
        assert_eq!(seqs[0].image_type, vec!["ORIGINAL", "PRIMARY"]);
        assert_eq!(classify(&seqs[0]), Some(BidsTarget::Dwi));
    }
}
