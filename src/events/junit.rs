//! Handler (e): accumulates finalized results in memory and serializes them
//! as a JUnit `results.xml` on `on_run_end`.

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::error::{DutTestError, FilesystemError};
use crate::result::EntityResult;

use super::{Handler, HandlerFuture};

#[derive(Debug, Serialize)]
#[serde(rename = "testsuites")]
struct TestSuites {
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@skipped")]
    skipped: usize,
    testsuite: TestSuite,
}

#[derive(Debug, Serialize)]
struct TestSuite {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@skipped")]
    skipped: usize,
    testcase: Vec<TestCase>,
}

#[derive(Debug, Serialize)]
struct TestCase {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@time")]
    time_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<Skipped>,
}

#[derive(Debug, Serialize)]
struct Failure {
    #[serde(rename = "@message")]
    message: String,
    #[serde(rename = "$text")]
    body: String,
}

#[derive(Debug, Serialize)]
struct Skipped {
    #[serde(rename = "@message")]
    message: String,
}

/// Writes `results.xml` in JUnit format once the run finishes.
pub struct JUnitWriter {
    path: Utf8PathBuf,
    results: Vec<EntityResult>,
}

impl JUnitWriter {
    /// Creates a writer that will serialize to `path` on `on_run_end`.
    #[must_use]
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            results: Vec::new(),
        }
    }

    fn to_xml(&self) -> String {
        let failures = self.results.iter().filter(|r| !r.errors.is_empty()).count();
        let skipped = self
            .results
            .iter()
            .filter(|r| r.errors.is_empty() && !r.skip_reasons.is_empty())
            .count();

        let testcases = self
            .results
            .iter()
            .map(|result| {
                let time_secs = result
                    .end
                    .map(|end| (end - result.start).num_milliseconds().max(0) as f64 / 1000.0)
                    .unwrap_or(0.0);
                let failure = result.errors.first().map(|first| Failure {
                    message: first.reason.clone(),
                    body: result
                        .errors
                        .iter()
                        .map(|e| format!("{} ({}:{})", e.reason, e.file, e.line))
                        .collect::<Vec<_>>()
                        .join("\n"),
                });
                let skipped = if failure.is_none() && !result.skip_reasons.is_empty() {
                    Some(Skipped {
                        message: result.skip_reasons.join("; "),
                    })
                } else {
                    None
                };
                TestCase {
                    name: result.name.clone(),
                    time_secs,
                    failure,
                    skipped,
                }
            })
            .collect();

        let suites = TestSuites {
            tests: self.results.len(),
            failures,
            skipped,
            testsuite: TestSuite {
                name: "duttest".to_owned(),
                tests: self.results.len(),
                failures,
                skipped,
                testcase: testcases,
            },
        };

        quick_xml::se::to_string(&suites).unwrap_or_else(|e| {
            format!("<!-- failed to serialize JUnit report: {e} -->")
        })
    }
}

impl Handler for JUnitWriter {
    fn name(&self) -> &'static str {
        "junit_writer"
    }

    fn on_entity_end<'a>(&'a mut self, result: &'a EntityResult) -> HandlerFuture<'a> {
        self.results.push(result.clone());
        Box::pin(async { Ok(()) })
    }

    fn on_run_end<'a>(&'a mut self, _error: Option<&'a DutTestError>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let xml = self.to_xml();
            tokio::fs::write(&self.path, xml).await.map_err(|e| {
                DutTestError::Filesystem(FilesystemError::IoError {
                    path: self.path.clone().into_std_path_buf(),
                    message: e.to_string(),
                })
            })
        })
    }
}
