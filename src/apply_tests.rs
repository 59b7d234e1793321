use super::*;
use crate::address::CellRef;
use crate::test_support::{plan_json, sample_write, sov_lock, sov_template, SOV_SHEET};
use crate::validate::ViolationKind;
use crate::workbook::CellValue;
use serde_json::{json, Value};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    request: ApplyRequest,
    sha: String,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = sov_template();
        let sha = sha256_hex(&template);
        let request = ApplyRequest {
            plan: dir.path().join("plan.json"),
            template: dir.path().join("template.xlsm"),
            lock: dir.path().join("template.lock.json"),
            out_xlsm: dir.path().join("out").join("filled.xlsm"),
            audit_jsonl: dir.path().join("out").join("audit.jsonl"),
        };
        fs::write(&request.template, template).expect("write template");
        sov_lock(&sha).write(&request.lock).expect("write lock");
        Fixture {
            _dir: dir,
            request,
            sha,
        }
    }

    fn write_plan(&self, plan: &Value) {
        fs::write(&self.request.plan, serde_json::to_vec_pretty(plan).expect("json"))
            .expect("write plan");
    }

    fn run(&self) -> Result<ApplySummary> {
        run_apply(&self.request, true)
    }

    fn audit_lines(&self) -> Option<usize> {
        fs::read_to_string(&self.request.audit_jsonl)
            .ok()
            .map(|text| text.lines().count())
    }

    fn output_value(&self, cell: &str) -> CellValue {
        Workbook::open(&self.request.out_xlsm)
            .expect("open output")
            .sheet(SOV_SHEET)
            .expect("sheet")
            .value(CellRef::parse(cell).expect("address"))
    }
}

fn guard_error(err: &anyhow::Error) -> &GuardError {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<GuardError>())
        .expect("guard error in chain")
}

#[test]
fn scenario_single_write_applies_and_audits() {
    let fx = Fixture::new();
    fx.write_plan(&plan_json(&fx.sha, vec![sample_write("I50", json!(12345.0))]));
    let summary = fx.run().expect("apply");
    assert_eq!(summary.writes, 1);
    assert_eq!(summary.template_sha256, fx.sha);
    assert_eq!(fx.output_value("I50"), CellValue::Number(12345.0));
    assert_eq!(fx.audit_lines(), Some(1));
    assert_eq!(
        fs::read(&fx.request.template).expect("template"),
        sov_template(),
        "template must stay pristine"
    );
}

#[test]
fn closed_gate_touches_nothing() {
    let fx = Fixture::new();
    fx.write_plan(&plan_json(&fx.sha, vec![sample_write("I50", json!(1))]));
    let err = run_apply(&fx.request, false).expect_err("gate closed");
    assert!(matches!(guard_error(&err), GuardError::EnvGate { .. }));
    assert!(!fx.request.out_xlsm.exists());
    assert_eq!(fx.audit_lines(), None);
}

#[test]
fn denied_column_stops_before_any_write() {
    let fx = Fixture::new();
    fx.write_plan(&plan_json(
        &fx.sha,
        vec![
            sample_write("I50", json!(12345.0)),
            sample_write("T50", json!(1.0)),
        ],
    ));
    let err = fx.run().expect_err("denied");
    match guard_error(&err) {
        GuardError::PolicyViolation { violations, .. } => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].kind, ViolationKind::DeniedColumn);
            assert_eq!(violations[0].cell.as_deref(), Some("T50"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(fx.audit_lines(), None);
    assert!(!fx.request.out_xlsm.exists());
}

#[test]
fn tampered_value_is_detected_before_apply() {
    let fx = Fixture::new();
    let mut plan = plan_json(&fx.sha, vec![sample_write("I50", json!(12345.0))]);
    plan["writes"][0]["value"] = json!(99999.0);
    fx.write_plan(&plan);
    let err = fx.run().expect_err("tamper");
    assert!(matches!(guard_error(&err), GuardError::ConfigMismatch { .. }));
    assert!(err.to_string().contains("tamper") || format!("{err:#}").contains("tamper"));
    assert_eq!(fx.audit_lines(), None);
    assert!(!fx.request.out_xlsm.exists());
}

#[test]
fn missing_plan_hash_is_a_hard_failure() {
    let fx = Fixture::new();
    let mut plan = plan_json(&fx.sha, vec![sample_write("I50", json!(1))]);
    plan.as_object_mut().expect("object").remove("plan_hash");
    fx.write_plan(&plan);
    let err = fx.run().expect_err("no hash");
    assert!(matches!(guard_error(&err), GuardError::ConfigMismatch { .. }));
}

#[test]
fn template_file_must_match_lock() {
    let fx = Fixture::new();
    fx.write_plan(&plan_json(&fx.sha, vec![sample_write("I50", json!(1))]));
    let mut other = sov_template();
    other.extend_from_slice(b"\0");
    fs::write(&fx.request.template, other).expect("swap template");
    let err = fx.run().expect_err("sha mismatch");
    assert!(matches!(guard_error(&err), GuardError::ConfigMismatch { .. }));
    assert!(format!("{err:#}").contains("template file sha"));
}

#[test]
fn duplicate_targets_fail_preflight() {
    let fx = Fixture::new();
    fx.write_plan(&plan_json(
        &fx.sha,
        vec![sample_write("I50", json!(1)), sample_write("I50", json!(2))],
    ));
    let err = fx.run().expect_err("duplicate");
    match guard_error(&err) {
        GuardError::PolicyViolation { stage, violations } => {
            assert_eq!(*stage, "preflight");
            assert_eq!(violations[0].kind, ViolationKind::DuplicateCell);
            assert!(violations[0].message.contains("2 times"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn merged_target_fails_closed_and_saves_nothing() {
    let fx = Fixture::new();
    fx.write_plan(&plan_json(
        &fx.sha,
        vec![sample_write("I50", json!(1.0)), sample_write("I55", json!(2.0))],
    ));
    let err = fx.run().expect_err("merged");
    assert!(matches!(
        guard_error(&err),
        GuardError::CellSafetyViolation { cell, .. } if cell == "I55"
    ));
    assert_eq!(fx.audit_lines(), Some(1));
    let audit = fs::read_to_string(&fx.request.audit_jsonl).expect("audit");
    assert!(!audit.contains("\"I55\""));
    assert!(!fx.request.out_xlsm.exists());
}

#[test]
fn applying_twice_is_deterministic() {
    let first = Fixture::new();
    let second = Fixture::new();
    let writes = vec![
        sample_write("I13", json!(100)),
        sample_write("I50", json!(12345.0)),
        sample_write("C3", json!("Tower B")),
    ];
    first.write_plan(&plan_json(&first.sha, writes.clone()));
    second.write_plan(&plan_json(&second.sha, writes));
    first.run().expect("first apply");
    second.run().expect("second apply");
    for cell in ["I13", "I50", "C3"] {
        assert_eq!(first.output_value(cell), second.output_value(cell));
    }
    assert_eq!(
        fs::read(&first.request.out_xlsm).expect("first"),
        fs::read(&second.request.out_xlsm).expect("second")
    );
}
