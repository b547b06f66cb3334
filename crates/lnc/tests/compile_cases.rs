//! Fixture-driven end-to-end tests.
//!
//! Every `tests/compile_cases/*.ln` is compiled through `compile_string`.
//! A sibling `.amm` file is the exact expected output; a sibling `.error`
//! file is text the compile error must contain. Output mismatches render
//! as a unified diff.

use std::{fs, path::Path};

use similar::TextDiff;

fn compile_case(path: &Path) -> datatest_stable::Result<()> {
    let source = fs::read_to_string(path)?;
    let amm_path = path.with_extension("amm");
    let error_path = path.with_extension("error");

    match lnc::compile_string(&source) {
        Ok(amm) => {
            if error_path.exists() {
                return Err(format!("expected a compile error, got success:\n{amm}").into());
            }
            let expected = fs::read_to_string(&amm_path)
                .map_err(|e| format!("missing expected output {}: {e}", amm_path.display()))?;
            let actual = format!("{}\n", amm.trim_end());
            let expected_norm = format!("{}\n", expected.trim_end());
            if actual != expected_norm {
                let diff = TextDiff::from_lines(&expected_norm, &actual);
                return Err(format!(
                    "AMM output mismatch for {}:\n{}",
                    path.display(),
                    diff.unified_diff().header("expected", "actual")
                )
                .into());
            }
            Ok(())
        }
        Err(err) => {
            if amm_path.exists() {
                return Err(format!("expected success, got error:\n{err}").into());
            }
            let expected = fs::read_to_string(&error_path)
                .map_err(|e| format!("missing expected error {}: {e}", error_path.display()))?;
            let rendered = err.to_string();
            if !rendered.contains(expected.trim_end()) {
                return Err(format!(
                    "error mismatch for {}:\nexpected to contain:\n{}\ngot:\n{rendered}",
                    path.display(),
                    expected.trim_end()
                )
                .into());
            }
            Ok(())
        }
    }
}

datatest_stable::harness!(compile_case, "tests/compile_cases", r"^.*\.ln$");
