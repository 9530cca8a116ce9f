//! Polling helpers and wire-level assertions

use std::time::Duration;

use nethub::{CommandResponse, ConnectionRecord, ConnectionRegistry, Status};

/// Poll `check` until it returns `Some` or five seconds pass
pub async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `count` records are closed and return them
pub async fn wait_for_closed(registry: &ConnectionRegistry, count: usize) -> Vec<ConnectionRecord> {
    wait_for(|| {
        let closed: Vec<_> = registry
            .snapshot()
            .into_iter()
            .filter(|r| r.is_closed())
            .collect();
        (closed.len() >= count).then_some(closed)
    })
    .await
}

/// Bytes a response occupied on the wire, newline included
pub fn wire_len(response: &CommandResponse) -> u64 {
    serde_json::to_string(response).expect("response serializes").len() as u64 + 1
}

pub fn assert_ok_text(response: &CommandResponse, expected: &str) {
    assert_eq!(response.status, Status::Ok, "{response:?}");
    assert_eq!(response.message(), Some(expected), "{response:?}");
}
