use super::support::{test_runtime, user, Harness};
use exemi_core::api::RequestBody;
use exemi_core::{
    ChatEvent, ClientError, MagicFailurePolicy, Message, MessageRole, Method, MockReply,
    SendPhase,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn committed(id: i64, messages: Value) -> MockReply {
    MockReply::ok(json!({
        "id": id,
        "created_at": "2025-03-01T09:30:00.123456",
        "messages": messages,
    }))
}

fn drain(events: &mut UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn transcripts(events: &[ChatEvent]) -> Vec<Vec<Message>> {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Transcript(messages) => Some(messages.clone()),
            _ => None,
        })
        .collect()
}

fn phases(events: &[ChatEvent]) -> Vec<SendPhase> {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Phase(phase) => Some(*phase),
            _ => None,
        })
        .collect()
}

#[test]
fn streamed_reply_grows_in_place() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Post,
            "/conversation",
            committed(
                7,
                json!([
                    { "role": "system", "content": "You are a study helper." },
                    { "role": "user", "content": "hi" },
                ]),
            ),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/7",
            MockReply::chunks(["Hel", "lo, ", "wor", "ld!"]),
        );

    let chat = harness.chat();
    let mut events = chat.subscribe();
    runtime.block_on(chat.send("hi")).expect("send");

    let seen = drain(&mut events);
    let snapshots = transcripts(&seen);
    assert_eq!(snapshots[0], vec![Message::new(MessageRole::User, "hi")]);

    let streaming: Vec<&Vec<Message>> = snapshots
        .iter()
        .filter(|messages| {
            messages
                .last()
                .is_some_and(|last| last.role == MessageRole::Assistant)
        })
        .collect();
    assert!(streaming.iter().all(|messages| messages.len() == 3));
    let replies: Vec<&str> = streaming
        .iter()
        .filter_map(|messages| messages.last().map(|last| last.content.as_str()))
        .collect();
    assert_eq!(replies, ["", "Hel", "Hello, ", "Hello, wor", "Hello, world!"]);

    assert_eq!(
        phases(&seen),
        [
            SendPhase::Sending,
            SendPhase::Committed,
            SendPhase::Streaming,
            SendPhase::Idle,
        ]
    );
    assert!(seen.contains(&ChatEvent::Active(Some(7))));

    let transcript = chat.transcript();
    assert_eq!(transcript.len(), 3);
    assert_eq!(transcript[2].content, "Hello, world!");
    assert_eq!(
        chat.visible_transcript(),
        vec![
            Message::new(MessageRole::User, "hi"),
            Message::new(MessageRole::Assistant, "Hello, world!"),
        ]
    );
    assert_eq!(chat.active_conversation(), Some(7));
    assert_eq!(chat.conversations().len(), 1);
    assert_eq!(chat.send_phase(), SendPhase::Idle);
    assert!(!chat.is_busy());

    let post = harness
        .mock
        .last_call(Method::Post, "/conversation")
        .expect("post");
    assert_eq!(post.body, RequestBody::Json(json!({ "message_text": "hi" })));
    assert_eq!(post.bearer.as_deref(), Some(super::support::TOKEN));
}

#[test]
fn split_multibyte_character_is_never_mangled() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    let euro = "€".as_bytes();
    harness
        .mock
        .on(
            Method::Post,
            "/conversation",
            committed(3, json!([{ "role": "user", "content": "price?" }])),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/3",
            MockReply::chunks([
                [b"It costs ".as_slice(), &euro[..2]].concat(),
                [&euro[2..], b"5".as_slice()].concat(),
            ]),
        );

    let chat = harness.chat();
    let mut events = chat.subscribe();
    runtime.block_on(chat.send("price?")).expect("send");

    for messages in transcripts(&drain(&mut events)) {
        for message in messages {
            assert!(!message.content.contains('\u{FFFD}'), "{message:?}");
        }
    }
    assert_eq!(
        chat.transcript().last().map(|last| last.content.clone()),
        Some("It costs €5".to_string())
    );
}

#[test]
fn new_conversation_id_is_reused_on_next_send() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Post,
            "/conversation",
            committed(11, json!([{ "role": "user", "content": "one" }])),
        )
        .on(
            Method::Post,
            "/conversation/11",
            committed(
                11,
                json!([
                    { "role": "user", "content": "one" },
                    { "role": "assistant", "content": "first" },
                    { "role": "user", "content": "two" },
                ]),
            ),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/11",
            MockReply::chunks(["first"]),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/11",
            MockReply::chunks(["second"]),
        );

    let chat = harness.chat();
    runtime.block_on(async {
        chat.send("one").await.expect("first send");
        chat.send("two").await.expect("second send");
    });

    assert_eq!(harness.mock.call_count(Method::Post, "/conversation"), 1);
    assert_eq!(harness.mock.call_count(Method::Post, "/conversation/11"), 1);
    assert_eq!(chat.conversations().len(), 1);
    let transcript = chat.transcript();
    assert_eq!(transcript.len(), 4);
    assert_eq!(transcript[3], Message::new(MessageRole::Assistant, "second"));
}

#[test]
fn failed_post_keeps_optimistic_message() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness.mock.on(
        Method::Post,
        "/conversation",
        MockReply::detail(500, "Conversation could not be saved"),
    );

    let chat = harness.chat();
    let mut events = chat.subscribe();
    let err = runtime.block_on(chat.send("hello")).unwrap_err();

    assert!(matches!(err, ClientError::Server { status: 500, .. }));
    assert_eq!(
        chat.transcript(),
        vec![Message::new(MessageRole::User, "hello")]
    );
    assert_eq!(chat.error().as_deref(), Some("Conversation could not be saved"));
    assert_eq!(
        phases(&drain(&mut events)),
        [SendPhase::Sending, SendPhase::Errored, SendPhase::Idle]
    );
    assert_eq!(
        harness
            .mock
            .call_count(Method::Get, "/conversation_stream_reply/1"),
        0
    );
    assert!(!chat.is_busy());
}

#[test]
fn gateway_timeout_surfaces_timeout_and_drops_placeholder() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Post,
            "/conversation",
            committed(5, json!([{ "role": "user", "content": "slow?" }])),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/5",
            MockReply::status(504),
        );

    let chat = harness.chat();
    let err = runtime.block_on(chat.send("slow?")).unwrap_err();

    assert_eq!(err, ClientError::Timeout);
    assert_eq!(
        chat.transcript(),
        vec![Message::new(MessageRole::User, "slow?")]
    );
    let message = chat.error().expect("error message");
    assert!(message.contains("too long"), "{message}");
    assert_eq!(chat.send_phase(), SendPhase::Idle);
}

#[test]
fn rejected_stream_uses_server_detail() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Post,
            "/conversation",
            committed(5, json!([{ "role": "user", "content": "hi" }])),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/5",
            MockReply::detail(500, "The language model is unavailable"),
        );

    let chat = harness.chat();
    let err = runtime.block_on(chat.send("hi")).unwrap_err();

    assert!(matches!(err, ClientError::Server { status: 500, .. }));
    assert_eq!(
        chat.error().as_deref(),
        Some("The language model is unavailable")
    );
    assert_eq!(chat.transcript().len(), 1);
}

#[test]
fn broken_stream_keeps_partial_reply() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Post,
            "/conversation",
            committed(5, json!([{ "role": "user", "content": "hi" }])),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/5",
            MockReply::chunks(["Half an ", "answer"]).then_fail("connection reset"),
        );

    let chat = harness.chat();
    let err = runtime.block_on(chat.send("hi")).unwrap_err();

    assert!(matches!(err, ClientError::Network(_)));
    assert_eq!(
        chat.transcript().last(),
        Some(&Message::new(MessageRole::Assistant, "Half an answer"))
    );
    assert_eq!(
        chat.error().as_deref(),
        Some("System error! Please contact the study team.")
    );
}

#[test]
fn second_send_is_rejected_while_first_streams() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Post,
            "/conversation",
            committed(5, json!([{ "role": "user", "content": "first" }])),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/5",
            MockReply::chunks(["ok"]).with_delay(Duration::from_millis(20)),
        );

    let chat = harness.chat();
    let (first, second) = runtime.block_on(async {
        let later = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(chat.is_busy());
            chat.send("second").await
        };
        tokio::join!(chat.send("first"), later)
    });

    first.expect("first send");
    assert_eq!(second.unwrap_err(), ClientError::Busy);
    assert_eq!(harness.mock.call_count(Method::Post, "/conversation"), 1);
    assert_eq!(harness.mock.call_count(Method::Post, "/conversation/5"), 0);
    assert!(chat
        .transcript()
        .iter()
        .all(|message| message.content != "second"));
    assert!(!chat.is_busy());
}

#[test]
fn chat_is_inert_until_ready() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    let chat = harness.chat();

    runtime.block_on(async {
        assert_eq!(chat.send("hi").await.unwrap_err(), ClientError::NotReady);
        assert_eq!(
            chat.list_conversations("1004").await.unwrap_err(),
            ClientError::NotReady
        );
        assert_eq!(
            chat.load_messages(Some(3)).await.unwrap_err(),
            ClientError::NotReady
        );
        assert_eq!(
            chat.delete_conversation(3).await.unwrap_err(),
            ClientError::NotReady
        );
    });

    assert!(harness.mock.calls().is_empty());
    assert!(chat.transcript().is_empty());
    assert!(!chat.is_busy());
}

#[test]
fn blank_send_does_nothing() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    let before = harness.mock.calls().len();

    let chat = harness.chat();
    runtime.block_on(chat.send("   ")).expect("blank send");

    assert_eq!(harness.mock.calls().len(), before);
    assert!(chat.transcript().is_empty());
}

#[test]
fn lists_conversations_newest_first() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness.mock.on(
        Method::Get,
        "/conversations/1004",
        MockReply::ok(json!([
            { "id": 9, "created_at": "2025-03-02T10:00:00", "user_id": 4 },
            { "id": 8, "created_at": "2025-03-01T10:00:00.5", "user_id": 4 },
        ])),
    );

    let chat = harness.chat();
    let mut events = chat.subscribe();
    let listed = runtime
        .block_on(chat.list_own_conversations())
        .expect("list");

    let ids: Vec<i64> = listed.iter().map(|conversation| conversation.id).collect();
    assert_eq!(ids, [9, 8]);
    assert_eq!(chat.conversations(), listed);
    assert!(drain(&mut events).contains(&ChatEvent::Conversations(listed)));
    let call = harness
        .mock
        .last_call(Method::Get, "/conversations/1004")
        .expect("list call");
    assert_eq!(call.bearer.as_deref(), Some(super::support::TOKEN));
}

#[test]
fn only_admins_list_other_users() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));

    let chat = harness.chat();
    let err = runtime
        .block_on(chat.list_conversations("2001"))
        .unwrap_err();
    assert!(matches!(err, ClientError::Auth(_)));
    assert_eq!(
        chat.error().as_deref(),
        Some("You are not authorised to view these conversations")
    );
    assert_eq!(harness.mock.call_count(Method::Get, "/conversations/2001"), 0);

    let admin = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(admin.ready_as(&user(1, "staff", true)));
    admin
        .mock
        .on(Method::Get, "/conversations/2001", MockReply::ok(json!([])));
    let listed = runtime
        .block_on(admin.chat().list_conversations("2001"))
        .expect("admin list");
    assert!(listed.is_empty());
}

#[test]
fn failed_listing_keeps_previous_list() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Get,
            "/conversations/1004",
            MockReply::ok(json!([{ "id": 2, "created_at": "2025-03-01T10:00:00" }])),
        )
        .on(
            Method::Get,
            "/conversations/1004",
            MockReply::transport_error("connection refused"),
        );

    let chat = harness.chat();
    runtime.block_on(async {
        chat.list_own_conversations().await.expect("first list");
        assert!(matches!(
            chat.list_own_conversations().await,
            Err(ClientError::Network(_))
        ));
    });

    assert_eq!(chat.conversations().len(), 1);
    assert_eq!(
        chat.error().as_deref(),
        Some("System error! Please contact the study team.")
    );
}

#[test]
fn selecting_loads_transcript_and_new_chat_stays_offline() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness.mock.on(
        Method::Get,
        "/conversation/2",
        MockReply::ok(json!({
            "id": 2,
            "created_at": "2025-03-01T10:00:00",
            "messages": [
                { "role": "system", "content": "rules" },
                { "role": "user", "content": "earlier" },
                { "role": "assistant", "content": "reply" },
                { "role": "tool", "content": "{}" },
            ],
        })),
    );

    let chat = harness.chat();
    runtime
        .block_on(chat.select_conversation(Some(2)))
        .expect("select");
    assert_eq!(chat.active_conversation(), Some(2));
    assert_eq!(chat.transcript().len(), 4);
    assert_eq!(chat.visible_transcript().len(), 2);

    let before = harness.mock.calls().len();
    let messages = runtime
        .block_on(chat.load_messages(None))
        .expect("new chat");
    assert!(messages.is_empty());
    assert!(chat.transcript().is_empty());
    assert_eq!(harness.mock.calls().len(), before);
}

#[test]
fn deleting_clears_selection_only_on_success() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Get,
            "/conversations/1004",
            MockReply::ok(json!([
                { "id": 2, "created_at": "2025-03-02T10:00:00" },
                { "id": 1, "created_at": "2025-03-01T10:00:00" },
            ])),
        )
        .on(
            Method::Get,
            "/conversation/2",
            MockReply::ok(json!({
                "id": 2,
                "messages": [{ "role": "user", "content": "keep me" }],
            })),
        )
        .on(
            Method::Delete,
            "/conversation/2",
            MockReply::detail(404, "Conversation not found"),
        )
        .on(Method::Delete, "/conversation/2", MockReply::ok(json!(null)));

    let chat = harness.chat();
    runtime.block_on(async {
        chat.list_own_conversations().await.expect("list");
        chat.select_conversation(Some(2)).await.expect("select");

        let err = chat.delete_conversation(2).await.unwrap_err();
        assert!(matches!(err, ClientError::Server { status: 404, .. }));
        assert_eq!(chat.active_conversation(), Some(2));
        assert_eq!(chat.transcript().len(), 1);
        assert_eq!(chat.error().as_deref(), Some("Conversation not found"));

        chat.delete_conversation(2).await.expect("delete");
    });

    assert_eq!(chat.active_conversation(), None);
    assert!(chat.transcript().is_empty());
    let remaining: Vec<i64> = chat
        .conversations()
        .iter()
        .map(|conversation| conversation.id)
        .collect();
    assert_eq!(remaining, [1]);
}

#[test]
fn failed_selection_keeps_current_conversation() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Get,
            "/conversation/2",
            MockReply::ok(json!({
                "id": 2,
                "messages": [{ "role": "user", "content": "conv two" }],
            })),
        )
        .on(
            Method::Get,
            "/conversation/3",
            MockReply::detail(404, "Conversation not found"),
        )
        .on(
            Method::Post,
            "/conversation/2",
            committed(
                2,
                json!([
                    { "role": "user", "content": "conv two" },
                    { "role": "user", "content": "hello" },
                ]),
            ),
        )
        .on(
            Method::Get,
            "/conversation_stream_reply/2",
            MockReply::chunks(["hi again"]),
        );

    let chat = harness.chat();
    let mut events = chat.subscribe();
    runtime.block_on(async {
        chat.select_conversation(Some(2)).await.expect("select 2");
        drain(&mut events);

        let err = chat.select_conversation(Some(3)).await.unwrap_err();
        assert!(matches!(err, ClientError::Server { status: 404, .. }));
        assert_eq!(chat.active_conversation(), Some(2));
        assert_eq!(
            chat.transcript(),
            vec![Message::new(MessageRole::User, "conv two")]
        );
        assert!(!drain(&mut events)
            .iter()
            .any(|event| matches!(event, ChatEvent::Active(_))));

        chat.send("hello").await.expect("send");
    });

    assert_eq!(harness.mock.call_count(Method::Post, "/conversation/2"), 1);
    assert_eq!(harness.mock.call_count(Method::Post, "/conversation/3"), 0);
    assert_eq!(chat.active_conversation(), Some(2));
}

#[test]
fn deleting_another_conversation_keeps_open_chat() {
    let runtime = test_runtime();
    let harness = Harness::new(MagicFailurePolicy::LogOut);
    runtime.block_on(harness.ready_as(&user(4, "1004", false)));
    harness
        .mock
        .on(
            Method::Get,
            "/conversations/1004",
            MockReply::ok(json!([
                { "id": 2, "created_at": "2025-03-02T10:00:00" },
                { "id": 1, "created_at": "2025-03-01T10:00:00" },
            ])),
        )
        .on(
            Method::Get,
            "/conversation/2",
            MockReply::ok(json!({
                "id": 2,
                "messages": [{ "role": "user", "content": "still open" }],
            })),
        )
        .on(Method::Delete, "/conversation/1", MockReply::ok(json!(null)));

    let chat = harness.chat();
    runtime.block_on(async {
        chat.list_own_conversations().await.expect("list");
        chat.select_conversation(Some(2)).await.expect("select");
        chat.delete_conversation(1).await.expect("delete");
    });

    assert_eq!(chat.active_conversation(), Some(2));
    assert_eq!(
        chat.transcript(),
        vec![Message::new(MessageRole::User, "still open")]
    );
    let remaining: Vec<i64> = chat
        .conversations()
        .iter()
        .map(|conversation| conversation.id)
        .collect();
    assert_eq!(remaining, [2]);
}
