use ngs_petsc::BridgeError;
use ngs_petsc::mesh::ImportOptions;
use ngs_petsc::solver::options::{KspType, PcType, StType, Which};
use ngs_petsc::solver::{EpsOptions, KspOptions, OptionsDb, SnesOptions};

#[test]
fn partial_json_fills_defaults() {
    let ksp: KspOptions =
        serde_json::from_str(r#"{"ksp_type": "cg", "rtol": 1e-8, "pc": {"pc_type": "jacobi"}}"#)
            .unwrap();
    assert_eq!(ksp.ksp_type, KspType::Cg);
    assert_eq!(ksp.pc.pc_type, Some(PcType::Jacobi));
    assert_eq!(ksp.max_it, KspOptions::default().max_it);
    ksp.validate().unwrap();
}

#[test]
fn json_round_trip_preserves_every_field() {
    let db = OptionsDb::parse(
        "-eps_nev 4 -eps_smallest_magnitude -st_type sinvert -st_ksp_type cg -st_pc_type sor",
    )
    .unwrap();
    let eps = EpsOptions::from_db(&db, "").unwrap();
    assert_eq!(eps.which, Which::SmallestMagnitude);
    assert_eq!(eps.st.st_type, StType::Sinvert);
    let text = serde_json::to_string(&eps).unwrap();
    assert!(text.contains(r#""which":"smallest_magnitude""#), "{text}");
    let back: EpsOptions = serde_json::from_str(&text).unwrap();
    assert_eq!(back, eps);

    let snes = SnesOptions::default();
    let back: SnesOptions = serde_json::from_str(&serde_json::to_string(&snes).unwrap()).unwrap();
    assert_eq!(back, snes);
}

#[test]
fn prefixes_select_independent_solvers() {
    let db = OptionsDb::parse("-outer_ksp_type cg -inner_ksp_type preonly -inner_pc_type ilu")
        .unwrap();
    let outer = KspOptions::from_db(&db, "outer_").unwrap();
    let inner = KspOptions::from_db(&db, "inner_").unwrap();
    assert_eq!(outer.ksp_type, KspType::Cg);
    assert_eq!(outer.pc.pc_type, None);
    assert_eq!(inner.ksp_type, KspType::Preonly);
    assert_eq!(inner.pc.pc_type, Some(PcType::Ilu));
    assert!(db.unused().is_empty());
}

#[test]
fn unknown_values_and_unread_keys_are_reported() {
    let db = OptionsDb::parse("-ksp_type bicgstab").unwrap();
    assert!(matches!(
        KspOptions::from_db(&db, ""),
        Err(BridgeError::InvalidOption { .. })
    ));

    let db = OptionsDb::parse("-ksp_rtol 1e-3 -ksp_monitr").unwrap();
    KspOptions::from_db(&db, "").unwrap();
    assert_eq!(db.unused(), vec!["ksp_monitr".to_string()]);
    assert_eq!(db.warn_unused(), 1);
}

#[test]
fn import_options_deserialize_with_defaults() {
    let o: ImportOptions = serde_json::from_str("{}").unwrap();
    assert_eq!(o, ImportOptions::default());
    let o: ImportOptions = serde_json::from_str(r#"{"ghost_layers": 2}"#).unwrap();
    assert_eq!(o.ghost_layers, 2);
    assert_eq!(o.purify_to_tets, None);
    let o: ImportOptions = serde_json::from_str(r#"{"purify_to_tets": true, "quad": false}"#).unwrap();
    assert_eq!(o.purify_to_tets, Some(true));
    assert_eq!(o.quad, Some(false));
    assert_eq!(o.ghost_layers, 1);
}
