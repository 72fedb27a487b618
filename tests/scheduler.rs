// tests/scheduler.rs

//! Plan execution: ordering, failure propagation, fail-fast and cancellation.

mod common;

use common::{FakeRunner, Fixture, Source, failed, ok};
use formulary::recipe::CookOutcome;
use formulary::{Error, ErrorClass, Scheduler};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

const MAKE_INSTALL: &str = r#"
[[build]]
step = "run"
program = "make"
args = ["install"]
"#;

fn depends_on(dep: &str) -> String {
    format!("\n[[dependencies]]\nname = \"{dep}\"\n{MAKE_INSTALL}")
}

/// Runner that fails the build whose source directory is `broken`
fn failing_in(broken: &'static str) -> FakeRunner {
    FakeRunner::with(move |spec| {
        if spec.cwd.ends_with(broken) {
            failed(2, "zutil.c:42: error: expected ';'")
        } else {
            ok("")
        }
    })
}

#[test]
fn test_failure_skips_dependents_but_not_independent_branches() {
    let mut fx = Fixture::new(failing_in("zlib-1.3.1"));
    fx.add(&Source::new("zlib", "1.3.1", &[("Makefile", "")]), MAKE_INSTALL);
    fx.add(&Source::new("libpng", "1.6.44", &[("Makefile", "")]), &depends_on("zlib"));
    fx.add(&Source::new("optipng", "0.7.8", &[("Makefile", "")]), &depends_on("libpng"));
    fx.add(&Source::new("lzo", "2.10", &[("Makefile", "")]), MAKE_INSTALL);

    let plan = fx.plan(&["optipng", "lzo"]);
    let kitchen = fx.kitchen();
    let report = Scheduler::new(&kitchen).run(&plan).unwrap();

    assert!(matches!(
        report.get("zlib").unwrap().outcome,
        CookOutcome::Failed {
            error: Error::BuildStepFailed { .. },
            ..
        }
    ));
    assert!(report.get("lzo").unwrap().outcome.is_installed());
    for name in ["libpng", "optipng"] {
        match &report.get(name).unwrap().outcome {
            CookOutcome::Skipped { root_cause } => assert_eq!(root_cause, "zlib"),
            other => panic!("{name} should be skipped, got {other:?}"),
        }
    }

    let skipped = report.skipped_by_root_cause();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped["zlib"], vec!["libpng", "optipng"]);

    // Skipped formulas never reached the runner
    let dirs: BTreeSet<String> = fx
        .runner
        .calls()
        .iter()
        .map(|c| c.cwd.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        dirs,
        BTreeSet::from(["zlib-1.3.1".to_string(), "lzo-2.10".to_string()])
    );
    assert!(!report.interrupted);
    assert_eq!(report.error_class(), Some(ErrorClass::Build));
    assert_eq!(report.results.len(), 4);
}

#[test]
fn test_dependencies_install_before_dependents() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&order);
    let mut fx = Fixture::new(FakeRunner::with(move |spec| {
        let dir = spec.cwd.file_name().unwrap().to_string_lossy().into_owned();
        record.lock().unwrap().push(dir);
        ok("")
    }));
    fx.config.jobs = 4;
    fx.add(&Source::new("zlib", "1.3.1", &[("Makefile", "")]), MAKE_INSTALL);
    fx.add(&Source::new("zstd", "1.5.6", &[("Makefile", "")]), MAKE_INSTALL);
    fx.add(
        &Source::new("libarchive", "3.7.7", &[("Makefile", "")]),
        &format!(
            "\n[[dependencies]]\nname = \"zlib\"\n\n\
             [[dependencies]]\nname = \"zstd\"\n{MAKE_INSTALL}"
        ),
    );

    let plan = fx.plan(&["libarchive"]);
    let report = Scheduler::new(&fx.kitchen()).run(&plan).unwrap();
    assert!(report.all_installed());

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 3);
    assert_eq!(order[2], "libarchive-3.7.7");
    assert_eq!(
        report.results.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        plan.order()
    );
}

#[test]
fn test_fail_fast_cancels_formulas_not_yet_started() {
    let mut fx = Fixture::new(failing_in("a-1.0"));
    fx.config.jobs = 1;
    fx.config.fail_fast = true;
    fx.add(&Source::new("a", "1.0", &[("Makefile", "")]), MAKE_INSTALL);
    fx.add(&Source::new("b", "1.0", &[("Makefile", "")]), MAKE_INSTALL);

    let plan = fx.plan(&["a", "b"]);
    assert_eq!(plan.order(), vec!["a", "b"]);
    let kitchen = fx.kitchen();
    let report = Scheduler::new(&kitchen).run(&plan).unwrap();

    assert!(matches!(
        report.get("a").unwrap().outcome,
        CookOutcome::Failed { .. }
    ));
    match &report.get("b").unwrap().outcome {
        CookOutcome::Skipped { root_cause } => assert_eq!(root_cause, "cancelled"),
        other => panic!("b should be cancelled, got {other:?}"),
    }
    assert_eq!(fx.runner.calls().len(), 1);
    // Fail-fast is not an interrupt
    assert!(!report.interrupted);
    assert_eq!(report.error_class(), Some(ErrorClass::Build));
}

#[test]
fn test_without_fail_fast_independent_formulas_still_build() {
    let mut fx = Fixture::new(failing_in("a-1.0"));
    fx.config.jobs = 1;
    fx.add(&Source::new("a", "1.0", &[("Makefile", "")]), MAKE_INSTALL);
    fx.add(&Source::new("b", "1.0", &[("Makefile", "")]), MAKE_INSTALL);

    let plan = fx.plan(&["a", "b"]);
    let report = Scheduler::new(&fx.kitchen()).run(&plan).unwrap();
    assert!(report.get("b").unwrap().outcome.is_installed());
    assert_eq!(fx.runner.calls().len(), 2);
}

#[test]
fn test_cancellation_before_start_reports_an_interrupt() {
    let mut fx = Fixture::new(FakeRunner::succeeding());
    fx.add(&Source::new("zlib", "1.3.1", &[("Makefile", "")]), MAKE_INSTALL);
    let plan = fx.plan(&["zlib"]);
    let kitchen = fx.kitchen();
    kitchen.cancel_token().cancel();

    let report = Scheduler::new(&kitchen).run(&plan).unwrap();
    assert!(report.interrupted);
    assert!(fx.runner.calls().is_empty());
    assert!(matches!(
        report.get("zlib").unwrap().outcome,
        CookOutcome::Skipped { .. }
    ));
    assert_eq!(report.error_class(), Some(ErrorClass::Interrupted));
    assert_eq!(report.error_class().unwrap().exit_code(), 130);
}

#[test]
fn test_checksum_failure_outranks_build_failure_in_exit_code() {
    let mut fx = Fixture::new(failing_in("a-1.0"));
    fx.add(&Source::new("a", "1.0", &[("Makefile", "")]), MAKE_INSTALL);
    fx.add(&Source::new("b", "1.0", &[("Makefile", "")]), MAKE_INSTALL);
    fx.fetcher
        .serve(&common::source_url("b", "1.0"), b"tampered".to_vec());

    let plan = fx.plan(&["a", "b"]);
    let report = Scheduler::new(&fx.kitchen()).run(&plan).unwrap();
    assert_eq!(report.error_class(), Some(ErrorClass::Checksum));
}
