#![cfg(unix)]

use std::time::Duration;

use observability_operator::shutdown::Phase;
use observability_operator::TerminationHandler;

// Kept alone in this binary: the listener stays installed for the whole process.
#[tokio::test]
async fn sigterm_moves_handler_to_terminating() {
    let handler = TerminationHandler::new();
    let _listener = handler.install().unwrap();
    assert_eq!(handler.phase(), Phase::Running);

    assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);

    tokio::time::timeout(Duration::from_secs(5), handler.terminated()).await.unwrap();
    assert_eq!(handler.phase(), Phase::Terminating);
    assert!(handler.token().is_cancelled());
}
