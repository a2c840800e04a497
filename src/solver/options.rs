//! PETSc-style options: a string database plus typed option structs.
//!
//! The database accepts `-key value` command lines or key/value pairs. Each
//! adapter reads its keys through `from_db(db, prefix)`; keys nobody read are
//! reported by [`OptionsDb::unused`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bridge_error::BridgeError;

fn invalid(key: &str, reason: impl Into<String>) -> BridgeError {
    BridgeError::InvalidOption {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Option families read by the adapters; a key names one of them after an
/// optional `prefix_`.
const FAMILIES: [&str; 5] = ["ksp_", "pc_", "eps_", "st_", "snes_"];

fn names_option(name: &str) -> bool {
    FAMILIES.iter().any(|f| {
        name.match_indices(f)
            .any(|(i, _)| i == 0 || name.as_bytes()[i - 1] == b'_')
    })
}

/// Key/value store of solver options. Keys are stored without the leading
/// dash; flags have no value.
#[derive(Clone, Debug, Default)]
pub struct OptionsDb {
    entries: BTreeMap<String, Option<String>>,
    used: RefCell<BTreeSet<String>>,
}

impl OptionsDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `-key value -flag -key2 value2` string. A token starting with
    /// `-` followed by a letter opens a new key when no key is waiting for a
    /// value, or when it names a known option family (`ksp_`, `pc_`, `eps_`,
    /// `st_`, `snes_`, possibly prefixed). Anything else is the value of the
    /// preceding key, so `-eps_target -inf` keeps `-inf` as the value.
    pub fn parse(args: &str) -> Result<Self, BridgeError> {
        let mut db = Self::new();
        let mut pending: Option<String> = None;
        for tok in args.split_whitespace() {
            let is_key = tok.len() > 1
                && tok.starts_with('-')
                && tok[1..].starts_with(|c: char| c.is_ascii_alphabetic())
                && (pending.is_none() || names_option(&tok[1..]));
            if is_key {
                if let Some(k) = pending.take() {
                    db.entries.insert(k, None);
                }
                pending = Some(tok[1..].to_string());
            } else {
                let key = pending
                    .take()
                    .ok_or_else(|| invalid(tok, "value without a preceding -key"))?;
                db.entries.insert(key, Some(tok.to_string()));
            }
        }
        if let Some(k) = pending {
            db.entries.insert(k, None);
        }
        Ok(db)
    }

    /// Build from key/value pairs, e.g. a parameter dictionary. An empty
    /// value marks a flag.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: ToString,
    {
        let mut db = Self::new();
        for (k, v) in pairs {
            let v = v.to_string();
            db.set(k.as_ref(), (!v.is_empty()).then_some(v));
        }
        db
    }

    pub fn set(&mut self, key: &str, value: Option<String>) {
        self.entries
            .insert(key.trim_start_matches('-').to_string(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw lookup; marks the key as used. `Some(None)` is a flag.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        let v = self.entries.get(key)?;
        self.used.borrow_mut().insert(key.to_string());
        Some(v.as_deref())
    }

    /// Typed lookup. A flag without a value is an error for non-flag keys.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, BridgeError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(None) => Err(invalid(key, "missing value")),
            Some(Some(v)) => v
                .parse()
                .map(Some)
                .map_err(|e| invalid(key, format!("cannot parse `{v}`: {e}"))),
        }
    }

    /// Boolean lookup: a bare flag is `true`.
    pub fn get_flag(&self, key: &str) -> Result<Option<bool>, BridgeError> {
        match self.get(key) {
            None => Ok(None),
            Some(None) => Ok(Some(true)),
            Some(Some(v)) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                other => Err(invalid(key, format!("`{other}` is not a boolean"))),
            },
        }
    }

    /// Keys never read, in sorted order.
    pub fn unused(&self) -> Vec<String> {
        let used = self.used.borrow();
        self.entries
            .keys()
            .filter(|k| !used.contains(*k))
            .cloned()
            .collect()
    }

    /// Log every unused key at `warn` and return how many there were.
    pub fn warn_unused(&self) -> usize {
        let unused = self.unused();
        for k in &unused {
            log::warn!("option -{k} was set but never used");
        }
        unused.len()
    }
}

macro_rules! option_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        "unknown value `{other}` (expected one of: {})",
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

option_enum!(
    /// Krylov method.
    KspType {
        Cg => "cg",
        Gmres => "gmres",
        Richardson => "richardson",
        Preonly => "preonly",
    }
);

option_enum!(
    PcType {
        None => "none",
        Jacobi => "jacobi",
        Sor => "sor",
        Ilu => "ilu",
        Shell => "shell",
    }
);

option_enum!(
    EpsType {
        Subspace => "subspace",
        Power => "power",
    }
);

option_enum!(
    /// Part of the spectrum to compute.
    Which {
        LargestMagnitude => "largest_magnitude",
        SmallestMagnitude => "smallest_magnitude",
        TargetMagnitude => "target_magnitude",
    }
);

option_enum!(
    /// Spectral transformation.
    StType {
        Shift => "shift",
        Sinvert => "sinvert",
    }
);

option_enum!(
    SnesType {
        NewtonLs => "newtonls",
    }
);

option_enum!(
    LineSearchType {
        Basic => "basic",
        Bt => "bt",
    }
);

fn read<T>(db: &OptionsDb, key: &str, slot: &mut T) -> Result<(), BridgeError>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(v) = db.get_parsed(key)? {
        *slot = v;
    }
    Ok(())
}

fn check(ok: bool, key: &str, reason: &str) -> Result<(), BridgeError> {
    if ok { Ok(()) } else { Err(invalid(key, reason)) }
}

/// Preconditioner options (`pc_*`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcOptions {
    /// `None` selects `ilu` for assembled operators and `none` for
    /// matrix-free ones.
    pub pc_type: Option<PcType>,
    pub sor_omega: f64,
    pub sor_its: usize,
}

impl Default for PcOptions {
    fn default() -> Self {
        Self {
            pc_type: None,
            sor_omega: 1.0,
            sor_its: 1,
        }
    }
}

impl PcOptions {
    pub fn from_db(db: &OptionsDb, prefix: &str) -> Result<Self, BridgeError> {
        Self::from_db_with(db, prefix, Self::default())
    }

    pub fn from_db_with(db: &OptionsDb, prefix: &str, base: Self) -> Result<Self, BridgeError> {
        let mut o = base;
        if let Some(t) = db.get_parsed(&format!("{prefix}pc_type"))? {
            o.pc_type = Some(t);
        }
        read(db, &format!("{prefix}pc_sor_omega"), &mut o.sor_omega)?;
        read(db, &format!("{prefix}pc_sor_its"), &mut o.sor_its)?;
        o.validate()?;
        Ok(o)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        check(
            self.sor_omega > 0.0 && self.sor_omega < 2.0,
            "pc_sor_omega",
            "relaxation factor must lie in (0, 2)",
        )?;
        check(self.sor_its >= 1, "pc_sor_its", "at least one sweep is required")
    }
}

/// Linear solver options (`ksp_*` plus the preconditioner's).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KspOptions {
    pub ksp_type: KspType,
    pub rtol: f64,
    pub atol: f64,
    pub divtol: f64,
    pub max_it: usize,
    pub gmres_restart: usize,
    pub richardson_scale: f64,
    pub initial_guess_nonzero: bool,
    pub pc: PcOptions,
}

impl Default for KspOptions {
    fn default() -> Self {
        Self {
            ksp_type: KspType::Gmres,
            rtol: 1e-5,
            atol: 1e-50,
            divtol: 1e5,
            max_it: 10_000,
            gmres_restart: 30,
            richardson_scale: 1.0,
            initial_guess_nonzero: false,
            pc: PcOptions::default(),
        }
    }
}

impl KspOptions {
    pub fn from_db(db: &OptionsDb, prefix: &str) -> Result<Self, BridgeError> {
        Self::from_db_with(db, prefix, Self::default())
    }

    /// Like [`from_db`](Self::from_db) but starting from `base` instead of
    /// the defaults.
    pub fn from_db_with(db: &OptionsDb, prefix: &str, base: Self) -> Result<Self, BridgeError> {
        let mut o = base;
        let key = |k: &str| format!("{prefix}ksp_{k}");
        read(db, &key("type"), &mut o.ksp_type)?;
        read(db, &key("rtol"), &mut o.rtol)?;
        read(db, &key("atol"), &mut o.atol)?;
        read(db, &key("divtol"), &mut o.divtol)?;
        read(db, &key("max_it"), &mut o.max_it)?;
        read(db, &key("gmres_restart"), &mut o.gmres_restart)?;
        read(db, &key("richardson_scale"), &mut o.richardson_scale)?;
        if let Some(f) = db.get_flag(&key("initial_guess_nonzero"))? {
            o.initial_guess_nonzero = f;
        }
        o.pc = PcOptions::from_db_with(db, prefix, o.pc)?;
        o.validate()?;
        Ok(o)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        check(
            (0.0..1.0).contains(&self.rtol),
            "ksp_rtol",
            "relative tolerance must lie in [0, 1)",
        )?;
        check(self.atol >= 0.0, "ksp_atol", "absolute tolerance must be non-negative")?;
        check(self.divtol > 0.0, "ksp_divtol", "divergence tolerance must be positive")?;
        check(self.max_it >= 1, "ksp_max_it", "at least one iteration is required")?;
        check(
            self.gmres_restart >= 1,
            "ksp_gmres_restart",
            "restart length must be positive",
        )?;
        check(
            self.richardson_scale.is_finite() && self.richardson_scale != 0.0,
            "ksp_richardson_scale",
            "damping factor must be finite and non-zero",
        )?;
        self.pc.validate()
    }
}

/// Spectral transformation options (`st_*`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StOptions {
    pub st_type: StType,
    /// `None`: the target for `target_magnitude`, otherwise 0.
    pub shift: Option<f64>,
    /// Inner solver for `(A - σB)` or `B`; read under `st_ksp_*`/`st_pc_*`.
    pub ksp: KspOptions,
}

impl Default for StOptions {
    fn default() -> Self {
        Self {
            st_type: StType::Shift,
            shift: None,
            ksp: KspOptions {
                rtol: 1e-12,
                ..KspOptions::default()
            },
        }
    }
}

/// Eigensolver options (`eps_*`, `st_*`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpsOptions {
    pub eps_type: EpsType,
    pub nev: usize,
    /// Subspace size; `None` means `max(2 nev, nev + 15)` capped at the
    /// problem size.
    pub ncv: Option<usize>,
    pub tol: f64,
    /// `None` means `max(100, 2 N / ncv)`.
    pub max_it: Option<usize>,
    pub which: Which,
    pub target: f64,
    pub st: StOptions,
}

impl Default for EpsOptions {
    fn default() -> Self {
        Self {
            eps_type: EpsType::Subspace,
            nev: 1,
            ncv: None,
            tol: 1e-8,
            max_it: None,
            which: Which::LargestMagnitude,
            target: 0.0,
            st: StOptions::default(),
        }
    }
}

impl EpsOptions {
    pub fn from_db(db: &OptionsDb, prefix: &str) -> Result<Self, BridgeError> {
        let mut o = Self::default();
        let key = |k: &str| format!("{prefix}eps_{k}");
        read(db, &key("type"), &mut o.eps_type)?;
        read(db, &key("nev"), &mut o.nev)?;
        if let Some(n) = db.get_parsed(&key("ncv"))? {
            o.ncv = Some(n);
        }
        read(db, &key("tol"), &mut o.tol)?;
        if let Some(n) = db.get_parsed(&key("max_it"))? {
            o.max_it = Some(n);
        }
        let mut chosen = Vec::new();
        for w in [Which::LargestMagnitude, Which::SmallestMagnitude, Which::TargetMagnitude] {
            if db.get_flag(&key(w.as_str()))? == Some(true) {
                chosen.push(w);
            }
        }
        let target: Option<f64> = db.get_parsed(&key("target"))?;
        if let Some(t) = target {
            o.target = t;
        }
        let has_target = target.is_some();
        o.which = match chosen.as_slice() {
            [] if has_target => Which::TargetMagnitude,
            [] => o.which,
            [w] => *w,
            _ => return Err(invalid(&key("which"), "more than one spectrum target selected")),
        };
        read(db, &format!("{prefix}st_type"), &mut o.st.st_type)?;
        if let Some(s) = db.get_parsed(&format!("{prefix}st_shift"))? {
            o.st.shift = Some(s);
        }
        o.st.ksp = KspOptions::from_db_with(db, &format!("{prefix}st_"), o.st.ksp)?;
        o.validate()?;
        Ok(o)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        check(self.nev >= 1, "eps_nev", "at least one eigenpair is required")?;
        if let Some(ncv) = self.ncv {
            check(ncv >= self.nev, "eps_ncv", "subspace must hold at least nev vectors")?;
        }
        check(self.tol > 0.0, "eps_tol", "tolerance must be positive")?;
        check(self.max_it != Some(0), "eps_max_it", "at least one iteration is required")?;
        check(self.target.is_finite(), "eps_target", "target must be finite")?;
        let transform_ok = match self.st.st_type {
            StType::Shift => self.which == Which::LargestMagnitude,
            StType::Sinvert => self.which != Which::LargestMagnitude,
        };
        check(
            transform_ok,
            "st_type",
            "largest_magnitude needs st_type shift; smallest and target magnitude need sinvert",
        )?;
        self.st.ksp.validate()
    }
}

/// Nonlinear solver options (`snes_*` plus the inner `ksp_*`/`pc_*`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnesOptions {
    pub snes_type: SnesType,
    pub linesearch: LineSearchType,
    pub rtol: f64,
    pub atol: f64,
    pub stol: f64,
    pub max_it: usize,
    pub max_funcs: usize,
    /// Finite-difference Jacobian action (`-snes_mf`).
    pub mf: bool,
    pub ksp: KspOptions,
}

impl Default for SnesOptions {
    fn default() -> Self {
        Self {
            snes_type: SnesType::NewtonLs,
            linesearch: LineSearchType::Bt,
            rtol: 1e-8,
            atol: 1e-50,
            stol: 1e-8,
            max_it: 50,
            max_funcs: 10_000,
            mf: false,
            ksp: KspOptions::default(),
        }
    }
}

impl SnesOptions {
    pub fn from_db(db: &OptionsDb, prefix: &str) -> Result<Self, BridgeError> {
        let mut o = Self::default();
        let key = |k: &str| format!("{prefix}snes_{k}");
        read(db, &key("type"), &mut o.snes_type)?;
        read(db, &key("linesearch_type"), &mut o.linesearch)?;
        read(db, &key("rtol"), &mut o.rtol)?;
        read(db, &key("atol"), &mut o.atol)?;
        read(db, &key("stol"), &mut o.stol)?;
        read(db, &key("max_it"), &mut o.max_it)?;
        read(db, &key("max_funcs"), &mut o.max_funcs)?;
        if let Some(f) = db.get_flag(&key("mf"))? {
            o.mf = f;
        }
        o.ksp = KspOptions::from_db(db, prefix)?;
        o.validate()?;
        Ok(o)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        check(
            (0.0..1.0).contains(&self.rtol),
            "snes_rtol",
            "relative tolerance must lie in [0, 1)",
        )?;
        check(self.atol >= 0.0, "snes_atol", "absolute tolerance must be non-negative")?;
        check(self.stol >= 0.0, "snes_stol", "step tolerance must be non-negative")?;
        check(self.max_it >= 1, "snes_max_it", "at least one iteration is required")?;
        check(self.max_funcs >= 1, "snes_max_funcs", "at least one function evaluation is required")?;
        self.ksp.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keys_values_and_flags() {
        let db = OptionsDb::parse("-ksp_type cg -ksp_rtol 1e-10 -ksp_initial_guess_nonzero -eps_target -2.5")
            .unwrap();
        assert_eq!(db.get("ksp_type"), Some(Some("cg")));
        assert_eq!(db.get_flag("ksp_initial_guess_nonzero").unwrap(), Some(true));
        assert_eq!(db.get_parsed::<f64>("eps_target").unwrap(), Some(-2.5));
        assert_eq!(db.unused(), vec!["ksp_rtol".to_string()]);
    }

    #[test]
    fn dash_values_stay_with_their_key() {
        let db = OptionsDb::parse(
            "-eps_target -inf -fs_monitor_label -left -outer_pc_type jacobi -snes_mf -st_ksp_type cg",
        )
        .unwrap();
        assert_eq!(db.get_parsed::<f64>("eps_target").unwrap(), Some(f64::NEG_INFINITY));
        assert_eq!(db.get("fs_monitor_label"), Some(Some("-left")));
        assert_eq!(db.get("outer_pc_type"), Some(Some("jacobi")));
        assert_eq!(db.get_flag("snes_mf").unwrap(), Some(true));
        assert_eq!(db.get("st_ksp_type"), Some(Some("cg")));
        assert_eq!(db.len(), 5);
        assert!(!names_option("mesh_label"));
        assert!(!names_option("inf"));
        assert!(names_option("inner_pc_type"));
    }

    #[test]
    fn value_without_key_is_rejected() {
        assert!(matches!(
            OptionsDb::parse("cg -ksp_type"),
            Err(BridgeError::InvalidOption { .. })
        ));
    }

    #[test]
    fn ksp_options_from_db() {
        let db = OptionsDb::from_pairs([("ksp_type", "cg"), ("ksp_max_it", "7"), ("pc_type", "jacobi")]);
        let o = KspOptions::from_db(&db, "").unwrap();
        assert_eq!(o.ksp_type, KspType::Cg);
        assert_eq!(o.max_it, 7);
        assert_eq!(o.pc.pc_type, Some(PcType::Jacobi));
        assert_eq!(o.rtol, 1e-5);
        assert!(db.unused().is_empty());
    }

    #[test]
    fn unknown_type_and_bad_range_are_rejected() {
        let db = OptionsDb::from_pairs([("ksp_type", "bicg")]);
        let err = KspOptions::from_db(&db, "").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOption { ref key, .. } if key == "ksp_type"));
        let db = OptionsDb::from_pairs([("pc_sor_omega", "2.5")]);
        assert!(KspOptions::from_db(&db, "").is_err());
    }

    #[test]
    fn eps_target_implies_target_magnitude() {
        let db = OptionsDb::parse("-eps_nev 3 -eps_target 1.5 -st_type sinvert -st_ksp_type cg").unwrap();
        let o = EpsOptions::from_db(&db, "").unwrap();
        assert_eq!(o.which, Which::TargetMagnitude);
        assert_eq!(o.target, 1.5);
        assert_eq!(o.st.st_type, StType::Sinvert);
        assert_eq!(o.st.ksp.ksp_type, KspType::Cg);
        assert_eq!(o.st.ksp.rtol, 1e-12);
    }

    #[test]
    fn smallest_magnitude_needs_sinvert() {
        let db = OptionsDb::parse("-eps_smallest_magnitude").unwrap();
        let err = EpsOptions::from_db(&db, "").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOption { ref key, .. } if key == "st_type"));
    }

    #[test]
    fn snes_reads_inner_ksp() {
        let db = OptionsDb::parse("-snes_mf -snes_linesearch_type basic -ksp_type gmres -ksp_rtol 1e-9").unwrap();
        let o = SnesOptions::from_db(&db, "").unwrap();
        assert!(o.mf);
        assert_eq!(o.linesearch, LineSearchType::Basic);
        assert_eq!(o.ksp.rtol, 1e-9);
    }
}
