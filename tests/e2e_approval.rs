//! End-to-end download approval tests.
//!
//! A station with an auto-download size limit receives a message above the
//! limit and the operator (or the lack of one) decides its fate.

use std::sync::Arc;
use std::time::Duration;

use b2f::app::{DownloadApproval, MemoryMailbox, PromptEvent, PromptHub, PromptKind};
use b2f::protocol::{Message, MsgType, Session, TrafficStats};

fn message() -> Message {
    let mut msg = Message::new(MsgType::Private, "LA5NTA");
    msg.add_to(["LE1OF"]);
    msg.set_subject("Large");
    msg.set_body(&"Lorem ipsum dolor sit amet.\r\n".repeat(40));
    msg
}

/// Run one exchange where LE1OF (master) approves downloads through `prompts`.
async fn exchange(prompts: PromptHub, prompt_timeout: Duration) -> (Arc<MemoryMailbox>, Arc<MemoryMailbox>, TrafficStats) {
    let sender = Arc::new(MemoryMailbox::new());
    let receiver = Arc::new(MemoryMailbox::new());
    sender.post(message()).await;

    let approval = DownloadApproval::new(receiver.clone(), prompts, 10).with_prompt_timeout(prompt_timeout);

    let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
    let mut a = Session::new("LA5NTA", "LE1OF", "").with_mailbox(sender.clone());
    let mut b = Session::new("LE1OF", "LA5NTA", "")
        .with_mailbox(Arc::new(approval))
        .with_master(true);

    let (res_a, res_b) = tokio::join!(a.exchange(stream_a), b.exchange(stream_b));
    let stats = res_a.unwrap();
    res_b.unwrap();
    (sender, receiver, stats)
}

#[tokio::test]
async fn test_operator_selects_message() {
    let prompts = PromptHub::new();
    let mut rx = prompts.add_prompter().await;

    let operator = {
        let prompts = prompts.clone();
        tokio::spawn(async move {
            let Some(PromptEvent::Open(prompt)) = rx.recv().await else {
                panic!("expected a prompt");
            };
            assert_eq!(prompt.kind, PromptKind::MultiSelect);
            assert_eq!(prompt.options.len(), 1);
            assert!(!prompt.options[0].checked);
            assert!(prompts.respond(prompt.id, prompt.options[0].value.clone()).await);
        })
    };

    let (sender, receiver, stats) = exchange(prompts, Duration::from_secs(5)).await;
    operator.await.unwrap();

    assert_eq!(stats.sent.len(), 1);
    assert!(sender.outbox().await.is_empty());
    assert_eq!(receiver.inbox().await.len(), 1);
}

#[tokio::test]
async fn test_unanswered_prompt_defers() {
    let prompts = PromptHub::new();
    let _rx = prompts.add_prompter().await;

    let (sender, receiver, stats) = exchange(prompts, Duration::from_millis(50)).await;

    // Nothing is under the limit, so the default selection is empty.
    assert!(stats.sent.is_empty());
    let mid = sender.outbox().await[0].mid().to_string();
    assert!(sender.is_deferred(&mid).await);
    assert!(receiver.inbox().await.is_empty());
}

#[tokio::test]
async fn test_closed_hub_defers() {
    let prompts = PromptHub::new();
    prompts.close().await;

    let (sender, receiver, stats) = exchange(prompts, Duration::from_secs(5)).await;
    assert!(stats.sent.is_empty());
    assert_eq!(sender.outbox().await.len(), 1);
    assert!(receiver.inbox().await.is_empty());
}
