//! End-to-end tests for `uprez validate`.

#![cfg(unix)]

mod common;

use common::Fixture;
use predicates::prelude::*;

#[test]
fn test_valid_configuration_passes() {
    let fixture = Fixture::new();
    fixture.uprez("validate").assert().success().stdout(predicate::str::contains("valid"));
}

#[test]
fn test_unknown_process_reference_is_reported() {
    let fixture = Fixture::with_transforms(
        &common::DEFAULT_TRANSFORMS.replace("\"process\": \"copytool\"", "\"process\": \"ghost\""),
    );
    fixture
        .uprez("validate")
        .assert()
        .code(255)
        .stderr(predicate::str::contains("unknown process 'ghost'"));
}

#[test]
fn test_unresolvable_command_line_is_reported() {
    let fixture = Fixture::with_transforms(
        &common::DEFAULT_TRANSFORMS.replace("{x.input} {x.output}", "{x.input} {undefined.var}"),
    );
    fixture
        .uprez("validate")
        .assert()
        .code(255)
        .stderr(predicate::str::contains("undefined.var"));
}

#[test]
fn test_missing_executable_is_reported() {
    let fixture = Fixture::new();
    std::fs::remove_file(fixture.path("tools/copy.sh")).unwrap();
    fixture
        .uprez("validate")
        .assert()
        .code(255)
        .stderr(predicate::str::contains("copy.sh"));
}

#[test]
fn test_missing_registry_file_is_reported() {
    let fixture = Fixture::new();
    std::fs::remove_file(fixture.path("tools/transforms.config.json")).unwrap();
    fixture
        .uprez("validate")
        .assert()
        .code(255)
        .stderr(predicate::str::contains("does not exist"));
}
