use anyhow::Context;

use super::*;

#[test]
fn app_errors_map_to_http_status() {
    let cases: Vec<(anyhow::Error, StatusCode)> = vec![
        (AppError::ConfigInvalid("bad name".into()).into(), StatusCode::BAD_REQUEST),
        (AppError::NotFound("file system myfs".into()).into(), StatusCode::NOT_FOUND),
        (AppError::QuorumLoss("mon0".into()).into(), StatusCode::INTERNAL_SERVER_ERROR),
        (anyhow::anyhow!("disk on fire"), StatusCode::INTERNAL_SERVER_ERROR),
    ];
    for (err, expected) in cases {
        let (status, msg) = AppError::http(err);
        assert!(status == expected, "unexpected status for {:?}, got {}, expected {}", msg, status, expected);
    }
}

#[test]
fn context_keeps_the_error_kind() {
    let res: anyhow::Result<()> = Err(AppError::NotFound("object store keyring".into()).into());
    let err = match res.context("error configuring gateway") {
        Ok(()) => panic!("expected an error"),
        Err(err) => err,
    };
    let (status, msg) = AppError::http(err);
    assert!(status == StatusCode::NOT_FOUND, "unexpected status, got {}, expected 404", status);
    assert!(msg.contains("object store keyring"), "expected the cause in the message, got {:?}", msg);
}
