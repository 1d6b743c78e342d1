//! JUnit XML ingestion.
//!
//! Most runners can emit JUnit XML even when they cannot host a reporter
//! directly. This module turns such a file into the same [`TestReport`]s a
//! live runner would deliver, so the upload path does not care where the
//! events came from.
//!
//! # Mapping
//!
//! | JUnit child | Phase | Outcome |
//! |-------------|-------|---------|
//! | none | call | passed |
//! | `<failure>` | call | failed |
//! | `<error>` | setup | failed |
//! | `<skipped>` | call | skipped |
//!
//! A `<skipped type="pytest.xfail">` element marks the test as an expected
//! failure. `<system-out>` and `<system-err>` become captured output and
//! `<property>` elements inside a test case become user properties.
//!
//! # Test ids
//!
//! | Format | JUnit classname | JUnit name | Test id |
//! |--------|-----------------|------------|---------|
//! | pytest | `path.to.test` | `func` | `path/to/test.py::func` |
//! | pytest (collection error) | empty | `path.to.test` | `path/to/test.py` |
//! | nextest | `crate` | `mod::func` | `mod::func` |
//! | default | `suite.Class` | `func` | `suite.Class::func` |

use std::path::Path;
use std::time::Duration;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde::{Deserialize, Serialize};

use super::{Crash, FrameworkError, FrameworkResult, Outcome, Phase, TestReport};

/// Specifies how to convert JUnit XML attributes to test ids.
///
/// ```toml
/// [junit]
/// format = "pytest"
/// ```
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JunitFormat {
    /// `classname.replace('.', '/') + ".py::" + name`
    Pytest,

    /// cargo nextest puts the full path into `name`.
    Nextest,

    /// `classname::name`, or just `name` when the classname is empty.
    #[default]
    Default,
}

impl JunitFormat {
    /// Converts JUnit XML attributes to a test id.
    pub fn to_test_id(&self, classname: &str, name: &str) -> String {
        match self {
            // Collection errors name the module only.
            JunitFormat::Pytest if classname.is_empty() => {
                format!("{}.py", name.replace('.', "/"))
            }
            JunitFormat::Pytest => format!("{}.py::{}", classname.replace('.', "/"), name),
            JunitFormat::Nextest => name.to_string(),
            JunitFormat::Default if classname.is_empty() => name.to_string(),
            JunitFormat::Default => format!("{}::{}", classname, name),
        }
    }
}

impl std::str::FromStr for JunitFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pytest" => Ok(JunitFormat::Pytest),
            "nextest" => Ok(JunitFormat::Nextest),
            "default" => Ok(JunitFormat::Default),
            other => Err(format!(
                "unknown JUnit format '{}' (expected pytest, nextest or default)",
                other
            )),
        }
    }
}

/// Reads and parses a JUnit XML file.
pub fn parse_junit_file(path: &Path, format: JunitFormat) -> FrameworkResult<Vec<TestReport>> {
    let content = std::fs::read_to_string(path)?;
    parse_junit_xml(&content, format)
        .map_err(|e| FrameworkError::ParseError(format!("{}: {}", path.display(), e)))
}

/// Which text-bearing element the parser is inside.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Capture {
    Detail,
    Stdout,
    Stderr,
}

/// A `<testcase>` being assembled.
struct PendingCase {
    classname: String,
    name: String,
    time: f64,
    phase: Phase,
    outcome: Outcome,
    message: Option<String>,
    expected_failure: bool,
    detail: String,
    stdout: String,
    stderr: String,
    properties: Vec<(String, String)>,
}

impl PendingCase {
    fn from_element(element: &BytesStart<'_>) -> FrameworkResult<Self> {
        let mut case = PendingCase {
            classname: String::new(),
            name: String::new(),
            time: 0.0,
            phase: Phase::Call,
            outcome: Outcome::Passed,
            message: None,
            expected_failure: false,
            detail: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            properties: Vec::new(),
        };
        for (key, value) in attributes(element)? {
            match key.as_str() {
                "classname" => case.classname = value,
                "name" => case.name = value,
                "time" => case.time = value.trim().parse().unwrap_or(0.0),
                _ => {}
            }
        }
        if case.name.is_empty() {
            return Err(FrameworkError::ParseError(
                "<testcase> without a name attribute".to_string(),
            ));
        }
        Ok(case)
    }

    /// Records a `<failure>`, `<error>` or `<skipped>` child.
    ///
    /// Returns whether the element's text belongs to the report. pytest
    /// tells the phase of an `<error>` by its message; teardown errors and
    /// errors after a call failure leave the result unchanged.
    fn mark(&mut self, tag: &[u8], element: &BytesStart<'_>) -> FrameworkResult<bool> {
        let attrs = attributes(element)?;
        let attr = |wanted: &str| {
            attrs
                .iter()
                .find(|(k, _)| k == wanted)
                .map(|(_, v)| v.clone())
        };
        match tag {
            b"failure" => {
                self.phase = Phase::Call;
                self.outcome = Outcome::Failed;
            }
            b"error" => {
                let message = attr("message").unwrap_or_default();
                if self.outcome == Outcome::Failed || message.starts_with("failed on teardown") {
                    return Ok(false);
                }
                self.phase = if message.starts_with("collection failure") {
                    Phase::Collect
                } else {
                    Phase::Setup
                };
                self.outcome = Outcome::Failed;
            }
            _ => {
                self.phase = Phase::Call;
                self.outcome = Outcome::Skipped;
                self.expected_failure = attr("type").is_some_and(|t| t.ends_with("xfail"));
            }
        }
        self.message = attr("message");
        Ok(true)
    }

    fn into_report(self, format: JunitFormat) -> TestReport {
        let node_id = format.to_test_id(&self.classname, &self.name);
        let duration = Duration::try_from_secs_f64(self.time).unwrap_or_default();
        let mut report = TestReport::new(node_id, self.phase, self.outcome)
            .with_duration(duration)
            .with_stdout(self.stdout)
            .with_stderr(self.stderr);
        report.user_properties = self.properties;
        report.expected_failure = self.expected_failure;

        match self.outcome {
            Outcome::Failed => {
                let message = self
                    .message
                    .or_else(|| self.detail.lines().next().map(str::to_string))
                    .unwrap_or_default();
                let (path, line) = locate_crash(&self.detail).unwrap_or_default();
                report = report.with_crash(Crash::new(message, path, line));
            }
            Outcome::Skipped => {
                if let Some(reason) = self.message {
                    report = report.with_skip_reason(reason);
                }
            }
            Outcome::Passed | Outcome::Rerun => {}
        }
        report
    }
}

/// Parses JUnit XML content into phase reports, one per `<testcase>`.
pub fn parse_junit_xml(content: &str, format: JunitFormat) -> FrameworkResult<Vec<TestReport>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(false);

    let mut reports = Vec::new();
    let mut current: Option<PendingCase> = None;
    let mut capture: Option<Capture> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            FrameworkError::ParseError(format!(
                "invalid XML at position {}: {}",
                reader.error_position(),
                e
            ))
        })?;

        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"testcase" => current = Some(PendingCase::from_element(&e)?),
                tag @ (b"failure" | b"error" | b"skipped") => {
                    if let Some(case) = current.as_mut()
                        && case.mark(tag, &e)?
                    {
                        capture = Some(Capture::Detail);
                    }
                }
                b"system-out" if current.is_some() => capture = Some(Capture::Stdout),
                b"system-err" if current.is_some() => capture = Some(Capture::Stderr),
                b"property" => push_property(current.as_mut(), &e)?,
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"testcase" => {
                    reports.push(PendingCase::from_element(&e)?.into_report(format));
                }
                tag @ (b"failure" | b"error" | b"skipped") => {
                    if let Some(case) = current.as_mut() {
                        case.mark(tag, &e)?;
                    }
                }
                b"property" => push_property(current.as_mut(), &e)?,
                _ => {}
            },
            Event::Text(t) => {
                if let (Some(case), Some(target)) = (current.as_mut(), capture) {
                    let text = t
                        .unescape()
                        .map_err(|e| FrameworkError::ParseError(e.to_string()))?;
                    append(case, target, &text);
                }
            }
            Event::CData(c) => {
                if let (Some(case), Some(target)) = (current.as_mut(), capture) {
                    let bytes = c.into_inner();
                    append(case, target, &String::from_utf8_lossy(&bytes));
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"testcase" => {
                    capture = None;
                    if let Some(case) = current.take() {
                        reports.push(case.into_report(format));
                    }
                }
                b"failure" | b"error" | b"skipped" | b"system-out" | b"system-err" => {
                    capture = None;
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if current.is_some() {
        return Err(FrameworkError::ParseError(
            "unterminated <testcase> element".to_string(),
        ));
    }

    Ok(reports)
}

fn append(case: &mut PendingCase, target: Capture, text: &str) {
    let buffer = match target {
        Capture::Detail => &mut case.detail,
        Capture::Stdout => &mut case.stdout,
        Capture::Stderr => &mut case.stderr,
    };
    buffer.push_str(text);
}

fn push_property(case: Option<&mut PendingCase>, element: &BytesStart<'_>) -> FrameworkResult<()> {
    // Suite-level properties have no test case to attach to.
    let Some(case) = case else {
        return Ok(());
    };
    let attrs = attributes(element)?;
    let name = attrs.iter().find(|(k, _)| k == "name").map(|(_, v)| v);
    let value = attrs.iter().find(|(k, _)| k == "value").map(|(_, v)| v);
    if let Some(name) = name {
        case.properties
            .push((name.clone(), value.cloned().unwrap_or_default()));
    }
    Ok(())
}

fn attributes(element: &BytesStart<'_>) -> FrameworkResult<Vec<(String, String)>> {
    element
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| FrameworkError::ParseError(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| FrameworkError::ParseError(e.to_string()))?
                .into_owned();
            Ok((key, value))
        })
        .collect()
}

/// Finds the `path:line: ...` frame pytest prints last in a failure body.
fn locate_crash(detail: &str) -> Option<(String, u32)> {
    detail.lines().rev().find_map(|line| {
        let (location, _) = line.trim().split_once(": ")?;
        let (path, lineno) = location.rsplit_once(':')?;
        let lineno = lineno.parse::<u32>().ok()?;
        if path.is_empty() || path.contains(char::is_whitespace) {
            return None;
        }
        Some((path.to_string(), lineno))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{Verdict, classify};

    const PYTEST_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<testsuites>
  <testsuite name="pytest" errors="1" failures="1" skipped="2" tests="5" time="1.5">
    <testcase classname="tests.test_math" name="test_add" time="0.250">
      <properties>
        <property name="requirement" value="REQ-1"/>
      </properties>
      <system-out>adding numbers</system-out>
    </testcase>
    <testcase classname="tests.test_math" name="test_sub" time="0.050">
      <failure message="AssertionError: assert 1 == 0">def test_sub():
&gt;       assert 2 - 1 == 0
E       AssertionError: assert 1 == 0

tests/test_math.py:9: AssertionError</failure>
    </testcase>
    <testcase classname="tests.test_math" name="test_fixture" time="0.001">
      <error message="failed on setup with &quot;fixture 'db' not found&quot;">file tests/test_math.py, line 12</error>
    </testcase>
    <testcase classname="tests.test_math" name="test_hw" time="0.000">
      <skipped type="pytest.skip" message="needs hardware">tests/test_math.py:15: needs hardware</skipped>
    </testcase>
    <testcase classname="tests.test_math" name="test_known_bug" time="0.002">
      <skipped type="pytest.xfail" message="issue 42"/>
    </testcase>
  </testsuite>
</testsuites>"#;

    #[test]
    fn test_pytest_format() {
        let format = JunitFormat::Pytest;
        assert_eq!(
            format.to_test_id("libs.mng.api.test_list", "test_foo"),
            "libs/mng/api/test_list.py::test_foo"
        );
    }

    #[test]
    fn test_nextest_format() {
        let format = JunitFormat::Nextest;
        assert_eq!(
            format.to_test_id("mycrate", "module::submodule::test_func"),
            "module::submodule::test_func"
        );
    }

    #[test]
    fn test_default_format() {
        let format = JunitFormat::Default;
        assert_eq!(format.to_test_id("foo.Bar", "test_baz"), "foo.Bar::test_baz");
        assert_eq!(format.to_test_id("", "test_only_name"), "test_only_name");
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("pytest".parse::<JunitFormat>(), Ok(JunitFormat::Pytest));
        assert!("xunit".parse::<JunitFormat>().is_err());
    }

    #[test]
    fn test_parse_pytest_report() {
        let reports = parse_junit_xml(PYTEST_XML, JunitFormat::Pytest).unwrap();
        assert_eq!(reports.len(), 5);

        let add = &reports[0];
        assert_eq!(add.node_id, "tests/test_math.py::test_add");
        assert_eq!(add.phase, Phase::Call);
        assert_eq!(add.outcome, Outcome::Passed);
        assert_eq!(add.duration, Duration::from_millis(250));
        assert_eq!(add.stdout, "adding numbers");
        assert_eq!(
            add.user_properties,
            vec![("requirement".to_string(), "REQ-1".to_string())]
        );

        let sub = &reports[1];
        assert_eq!(sub.outcome, Outcome::Failed);
        let crash = sub.crash.as_ref().unwrap();
        assert_eq!(crash.message, "AssertionError: assert 1 == 0");
        assert_eq!(crash.path, "tests/test_math.py");
        assert_eq!(crash.line, 9);

        let fixture = &reports[2];
        assert_eq!(fixture.phase, Phase::Setup);
        assert_eq!(fixture.outcome, Outcome::Failed);
        assert_eq!(
            fixture.crash.as_ref().unwrap().message,
            "failed on setup with \"fixture 'db' not found\""
        );

        let hw = &reports[3];
        assert_eq!(hw.outcome, Outcome::Skipped);
        assert_eq!(hw.skip_reason.as_deref(), Some("needs hardware"));
        assert!(!hw.expected_failure);

        let known_bug = &reports[4];
        assert_eq!(known_bug.outcome, Outcome::Skipped);
        assert!(known_bug.expected_failure);
    }

    #[test]
    fn test_parse_collection_error() {
        let xml = r#"<testsuite>
  <testcase classname="" name="tests.test_broken" time="0.000">
    <error message="collection failure">ImportError while importing test module</error>
  </testcase>
</testsuite>"#;
        let reports = parse_junit_xml(xml, JunitFormat::Pytest).unwrap();
        assert_eq!(reports.len(), 1);
        let broken = &reports[0];
        assert_eq!(broken.node_id, "tests/test_broken.py");
        assert_eq!(broken.phase, Phase::Collect);
        assert_eq!(broken.outcome, Outcome::Failed);

        let c = classify(broken).unwrap();
        assert_eq!(c.verdict, Verdict::Error);
        assert_eq!(c.note, "collection failure");
    }

    #[test]
    fn test_teardown_error_after_pass_is_ignored() {
        let xml = r#"<testsuite>
  <testcase classname="tests.test_db" name="test_query" time="0.010">
    <error message="failed on teardown with &quot;ConnectionError&quot;">tests/test_db.py:30: ConnectionError</error>
  </testcase>
</testsuite>"#;
        let reports = parse_junit_xml(xml, JunitFormat::Pytest).unwrap();
        let query = &reports[0];
        assert_eq!(query.phase, Phase::Call);
        assert_eq!(query.outcome, Outcome::Passed);
        assert!(query.crash.is_none());
        assert_eq!(classify(query).unwrap().verdict, Verdict::Passed);
    }

    #[test]
    fn test_teardown_error_keeps_call_failure() {
        let xml = r#"<testsuite>
  <testcase classname="tests.test_db" name="test_insert" time="0.010">
    <failure message="AssertionError">tests/test_db.py:12: AssertionError</failure>
    <error message="failed on teardown with &quot;ConnectionError&quot;">tests/test_db.py:30: ConnectionError</error>
  </testcase>
</testsuite>"#;
        let reports = parse_junit_xml(xml, JunitFormat::Pytest).unwrap();
        let insert = &reports[0];
        assert_eq!(insert.phase, Phase::Call);
        assert_eq!(insert.outcome, Outcome::Failed);
        let crash = insert.crash.as_ref().unwrap();
        assert_eq!(crash.message, "AssertionError");
        assert_eq!(crash.line, 12);
        assert_eq!(classify(insert).unwrap().verdict, Verdict::Failed);
    }

    #[test]
    fn test_parse_empty_suite() {
        let xml = r#"<testsuite name="empty" tests="0"></testsuite>"#;
        assert!(parse_junit_xml(xml, JunitFormat::Default).unwrap().is_empty());
    }

    #[test]
    fn test_parse_self_closing_testcase() {
        let xml = r#"<testsuite><testcase classname="suite" name="quick" time="0.5"/></testsuite>"#;
        let reports = parse_junit_xml(xml, JunitFormat::Default).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].node_id, "suite::quick");
        assert_eq!(reports[0].duration, Duration::from_millis(500));
    }

    #[test]
    fn test_parse_rejects_unterminated_testcase() {
        let xml = r#"<testsuite><testcase classname="a" name="b">"#;
        assert!(parse_junit_xml(xml, JunitFormat::Default).is_err());
    }

    #[test]
    fn test_parse_rejects_nameless_testcase() {
        let xml = r#"<testsuite><testcase classname="a"/></testsuite>"#;
        assert!(matches!(
            parse_junit_xml(xml, JunitFormat::Default),
            Err(FrameworkError::ParseError(_))
        ));
    }

    #[test]
    fn test_locate_crash() {
        assert_eq!(
            locate_crash("boom\n\ntests/test_x.py:42: ValueError"),
            Some(("tests/test_x.py".to_string(), 42))
        );
        assert_eq!(locate_crash("no location here"), None);
    }
}
