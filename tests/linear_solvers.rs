mod util;
use util::*;

use ngs_petsc::BridgeError;
use ngs_petsc::algs::communicator::{Communicator, NoComm};
use ngs_petsc::matrix::{DistributedMatrix, wrap_operator};
use ngs_petsc::solver::options::{KspType, PcType};
use ngs_petsc::solver::{
    KspOptions, LinearSolver, OptionsDb, PcOptions, Preconditioner, SolverState, StopReason,
};
use ngs_petsc::vector::{DistributedVector, to_distributed};

/// `b = A * ones`, so the solution is all ones.
fn ones_rhs<C: Communicator>(a: &DistributedMatrix, comm: &C) -> DistributedVector {
    let ones = DistributedVector::from_owned(a.col_map(), &vec![1.0; a.col_map().n_owned()]).unwrap();
    let mut b = DistributedVector::zeros(a.row_map());
    a.mult(&ones, &mut b, comm).unwrap();
    b
}

fn solve_chain(size: usize, n: usize, args: &str) -> Vec<Vec<f64>> {
    run_ranks(size, |comm| {
        let chain = Chain::new(n, comm.rank(), comm.size());
        let (_, a) = chain.laplacian(&comm);
        let b = ones_rhs(&a, &comm);
        let db = OptionsDb::parse(args).unwrap();
        let mut ksp = LinearSolver::new();
        ksp.bind(&a, &KspOptions::from_db(&db, "").unwrap()).unwrap();
        assert_eq!(ksp.solve(&b, None, &comm).unwrap(), SolverState::Converged);
        ksp.result().unwrap().solution.owned().to_vec()
    })
}

#[test]
fn identity_reproduces_the_rhs() {
    let out = run_ranks(2, |comm| {
        let chain = Chain::new(6, comm.rank(), comm.size());
        let map = chain.map(&comm);
        let id = DistributedMatrix::identity(&map, &comm).unwrap();
        let local: Vec<f64> = chain.keys().iter().map(|&k| 1.0 + k as f64).collect();
        let b = to_distributed(&local, &map).unwrap();
        let mut ksp = LinearSolver::new();
        ksp.bind(&id, &KspOptions::default()).unwrap();
        ksp.solve(&b, None, &comm).unwrap();
        let res = ksp.result().unwrap();
        (b.owned().to_vec(), res.solution.owned().to_vec(), res.reason)
    });
    for (b, x, reason) in out {
        assert_close(&x, &b, 1e-10);
        assert!(reason.is_converged());
    }
}

#[test]
fn laplacian_converges_with_every_krylov_method() {
    let n = 24;
    for size in [1, 2, 3] {
        for args in [
            "-ksp_type cg -pc_type jacobi -ksp_rtol 1e-10",
            "-ksp_type cg -pc_type none -ksp_rtol 1e-10",
            "-ksp_type gmres -ksp_rtol 1e-10",
            "-ksp_type gmres -pc_type sor -ksp_gmres_restart 8 -ksp_rtol 1e-10",
        ] {
            for owned in solve_chain(size, n, args) {
                assert_close(&owned, &vec![1.0; owned.len()], 1e-6);
            }
        }
    }
}

#[test]
fn solutions_do_not_depend_on_rank_count() {
    let serial: Vec<f64> = solve_chain(1, 15, "-ksp_type cg -ksp_rtol 1e-12 -pc_type none")
        .concat();
    let parallel: Vec<f64> = solve_chain(3, 15, "-ksp_type cg -ksp_rtol 1e-12 -pc_type none")
        .concat();
    assert_close(&parallel, &serial, 1e-9);
}

#[test]
fn matrix_free_operator_defaults_to_no_preconditioner() {
    let out = run_ranks(2, |comm| {
        let chain = Chain::new(10, comm.rank(), comm.size());
        let map = chain.map(&comm);
        let a = wrap_operator(chain.laplacian_action(), &map, &map).unwrap();
        let b = ones_rhs(&a, &comm);
        let mut ksp = LinearSolver::new();
        let opts = KspOptions {
            rtol: 1e-10,
            ..KspOptions::default()
        };
        ksp.bind(&a, &opts).unwrap();
        assert_eq!(ksp.pc_type(), Some(PcType::None));
        ksp.solve(&b, None, &comm).unwrap();
        ksp.result().unwrap().solution.owned().to_vec()
    });
    for owned in out {
        assert_close(&owned, &vec![1.0; owned.len()], 1e-6);
    }
}

#[test]
fn result_before_solve_and_stale_state() {
    let chain = Chain::new(4, 0, 1);
    let (_, a) = chain.laplacian(&NoComm);
    let b = ones_rhs(&a, &NoComm);

    let mut ksp = LinearSolver::new();
    assert!(matches!(
        ksp.solve(&b, None, &NoComm),
        Err(BridgeError::SolverNotConfigured { .. })
    ));
    ksp.bind(&a, &KspOptions::default()).unwrap();
    assert!(matches!(ksp.result(), Err(BridgeError::ResultUnavailable { .. })));

    ksp.solve(&b, None, &NoComm).unwrap();
    assert!(ksp.result().is_ok());
    assert!(matches!(
        ksp.solve(&b, None, &NoComm),
        Err(BridgeError::StaleSolverState { .. })
    ));

    // rebinding resets the lifecycle
    ksp.bind(&a, &KspOptions::default()).unwrap();
    assert_eq!(ksp.state(), SolverState::Configured);
    assert_eq!(ksp.solve(&b, None, &NoComm).unwrap(), SolverState::Converged);
}

#[test]
fn initial_guess_is_used_only_when_requested() {
    let chain = Chain::new(5, 0, 1);
    let (map, a) = chain.laplacian(&NoComm);
    let b = ones_rhs(&a, &NoComm);
    let exact = DistributedVector::from_owned(&map, &[1.0; 5]).unwrap();

    let mut ksp = LinearSolver::new();
    let opts = KspOptions {
        initial_guess_nonzero: true,
        ..KspOptions::default()
    };
    ksp.bind(&a, &opts).unwrap();
    ksp.solve(&b, Some(&exact), &NoComm).unwrap();
    assert_eq!(ksp.result().unwrap().iterations, 0);

    ksp.bind(&a, &KspOptions::default()).unwrap();
    ksp.solve(&b, Some(&exact), &NoComm).unwrap();
    assert!(ksp.result().unwrap().iterations > 0);
}

#[test]
fn richardson_hits_the_iteration_cap() {
    let out = run_ranks(2, |comm| {
        let chain = Chain::new(12, comm.rank(), comm.size());
        let (_, a) = chain.laplacian(&comm);
        let b = ones_rhs(&a, &comm);
        let opts = KspOptions {
            ksp_type: KspType::Richardson,
            max_it: 5,
            pc: PcOptions {
                pc_type: Some(PcType::Jacobi),
                ..PcOptions::default()
            },
            ..KspOptions::default()
        };
        let mut ksp = LinearSolver::new();
        ksp.bind(&a, &opts).unwrap();
        let state = ksp.solve(&b, None, &comm).unwrap();
        let res = ksp.result().unwrap();
        (state, res.reason, res.iterations, res.diverged())
    });
    for (state, reason, its, diverged) in out {
        assert_eq!(state, SolverState::Diverged);
        assert_eq!(reason, StopReason::DivergedMaxIts);
        assert_eq!(its, 5);
        assert!(diverged);
    }
}

#[test]
fn shell_failure_on_one_rank_fails_every_rank() {
    let out = run_ranks(3, |comm| {
        let chain = Chain::new(9, comm.rank(), comm.size());
        let (_, a) = chain.laplacian(&comm);
        let b = ones_rhs(&a, &comm);
        let mut ksp = LinearSolver::new();
        let rank = comm.rank();
        ksp.set_shell_preconditioner(move |r: &[f64]| {
            if rank == 1 { Vec::new() } else { r.to_vec() }
        });
        let opts = KspOptions {
            pc: PcOptions {
                pc_type: Some(PcType::Shell),
                ..PcOptions::default()
            },
            ..KspOptions::default()
        };
        ksp.bind(&a, &opts).unwrap();
        let state = ksp.solve(&b, None, &comm).unwrap();
        (state, ksp.failure_reason().cloned(), ksp.result().is_err())
    });
    for (rank, (state, reason, no_result)) in out.into_iter().enumerate() {
        assert_eq!(state, SolverState::Failed);
        assert!(no_result);
        let reason = reason.unwrap();
        assert!(reason.operator.is_some());
        if rank != 1 {
            assert!(reason.message.contains("ranks [1]"), "{}", reason.message);
        }
    }
}

#[test]
fn standalone_preconditioner_applies_block_jacobi() {
    let out = run_ranks(2, |comm| {
        let chain = Chain::new(6, comm.rank(), comm.size());
        let (map, a) = chain.laplacian(&comm);
        let r = DistributedVector::from_owned(&map, &vec![4.0; map.n_owned()]).unwrap();
        let mut pc = Preconditioner::new();
        let opts = PcOptions {
            pc_type: Some(PcType::Jacobi),
            ..PcOptions::default()
        };
        pc.bind(&a, &opts).unwrap();
        assert_eq!(pc.apply(&r, &comm).unwrap(), SolverState::Converged);
        pc.result().unwrap().solution.owned().to_vec()
    });
    for z in out {
        assert_eq!(z, vec![2.0; 3]);
    }
}
