mod util;
use util::*;

use approx::assert_relative_eq;
use ngs_petsc::algs::communicator::Communicator;
use ngs_petsc::matrix::wrap_operator;
use ngs_petsc::solver::{EigenSolver, EpsOptions, OptionsDb, SolverState};

fn exact(n: usize, k: usize) -> f64 {
    2.0 - 2.0 * (k as f64 * std::f64::consts::PI / (n as f64 + 1.0)).cos()
}

fn solve(size: usize, n: usize, args: &'static str, matrix_free: bool) -> Vec<(Vec<f64>, usize)> {
    run_ranks(size, |comm| {
        let chain = Chain::new(n, comm.rank(), comm.size());
        let (map, a) = chain.laplacian(&comm);
        let a = if matrix_free {
            wrap_operator(chain.laplacian_action(), &map, &map).unwrap()
        } else {
            a
        };
        let db = OptionsDb::parse(args).unwrap();
        let mut eps = EigenSolver::new();
        eps.bind(&a, None, &EpsOptions::from_db(&db, "").unwrap()).unwrap();
        assert_eq!(eps.solve(&comm).unwrap(), SolverState::Converged);
        let res = eps.result().unwrap();
        (res.eigenvalues.clone(), res.converged)
    })
}

#[test]
fn largest_eigenvalues_on_two_ranks() {
    let n = 20;
    let out = solve(2, n, "-eps_nev 2 -eps_tol 1e-9", false);
    for (values, converged) in &out {
        assert!(*converged >= 2);
        assert_relative_eq!(values[0], exact(n, n), epsilon = 1e-7);
        assert_relative_eq!(values[1], exact(n, n - 1), epsilon = 1e-7);
    }
    // every rank reports bit-identical eigenvalues
    assert_eq!(out[0].0, out[1].0);
}

#[test]
fn matrix_free_operator_with_plain_shift() {
    let n = 16;
    let out = solve(3, n, "-eps_nev 1", true);
    for (values, _) in out {
        assert_relative_eq!(values[0], exact(n, n), epsilon = 1e-6);
    }
}

#[test]
fn target_with_shift_and_invert() {
    let n = 20;
    let args = concat!(
        "-eps_nev 2 -eps_target 0.5 -st_type sinvert ",
        "-st_ksp_type gmres -st_pc_type none -st_ksp_rtol 1e-12"
    );
    let out = solve(2, n, args, false);
    for (values, _) in out {
        let mut want: Vec<f64> = (1..=n).map(|k| exact(n, k)).collect();
        want.sort_by(|a, b| (a - 0.5).abs().total_cmp(&(b - 0.5).abs()));
        assert_relative_eq!(values[0], want[0], epsilon = 1e-8);
        assert_relative_eq!(values[1], want[1], epsilon = 1e-8);
    }
}

#[test]
fn eigenvectors_are_normalized_and_distributed() {
    let n = 10;
    let out = run_ranks(2, |comm| {
        let chain = Chain::new(n, comm.rank(), comm.size());
        let (_, a) = chain.laplacian(&comm);
        let mut eps = EigenSolver::new();
        eps.bind(&a, None, &EpsOptions::default()).unwrap();
        eps.solve(&comm).unwrap();
        let v = &eps.result().unwrap().eigenvectors[0];
        (v.owned().len(), v.norm(&comm).unwrap())
    });
    for (len, norm) in out {
        assert_eq!(len, 5);
        assert_relative_eq!(norm, 1.0, epsilon = 1e-10);
    }
}
