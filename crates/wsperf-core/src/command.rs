use std::fmt;

use crate::case::CaseDefinition;
use crate::ids::RunId;

/// Name attached to every outbound command. Workers do not receive it.
pub const PLACEHOLDER_TEST_NAME: &str = "foobar";

/// The `message_test` command line sent to a worker for one run.
///
/// Rendered through [`fmt::Display`]; the output is the exact text frame the
/// worker receives.
#[derive(Clone, Debug)]
pub struct TestCommand<'a> {
    pub name: &'static str,
    pub token: &'a RunId,
    pub case: &'a CaseDefinition,
}

impl<'a> TestCommand<'a> {
    pub fn new(token: &'a RunId, case: &'a CaseDefinition) -> Self {
        Self {
            name: PLACEHOLDER_TEST_NAME,
            token,
            case,
        }
    }
}

impl fmt::Display for TestCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let case = self.case;
        // rtts is never forwarded
        write!(
            f,
            "message_test:uri={};token={};size={};count={};quantile_count={};timeout={};binary={};sync={};rtts={};correctness={};",
            case.uri,
            self.token,
            case.size,
            case.count,
            case.quantile_count,
            case.timeout,
            case.binary,
            case.sync,
            false,
            case.correctness_label(),
        )
    }
}
