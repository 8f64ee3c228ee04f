mod common;

use common::{add_user, count_rows, test_db, ScriptedModel};
use std::sync::Arc;
use std::time::Duration;
use studyhall::db::{self, DbPool};
use studyhall::intent::{Mode, Operation};
use studyhall::reconcile::{Exchange, TitleSummarizer, TranscriptReconciler};
use studyhall::types::{MessageId, Role, SessionId, StoredMessage, StudyError, UserId};

fn send(session: &str, user: &UserId, question: &str, answer: &str) -> Exchange {
    Exchange {
        session_id: SessionId(session.to_string()),
        mode: Mode::Authenticated {
            user_id: user.clone(),
        },
        operation: Operation::Send,
        user_text: question.to_string(),
        assistant_text: answer.to_string(),
    }
}

async fn seed(pool: &DbPool, user: &UserId, rows: &[(&str, Role, &str, i64)]) {
    let sid = SessionId("s1".to_string());
    if let Err(e) = db::ensure_session(pool, &sid, user).await {
        panic!("ensure_session failed: {:?}", e);
    }
    for (id, role, content, created_at) in rows {
        let message = StoredMessage {
            id: MessageId(id.to_string()),
            session_id: sid.clone(),
            user_id: Some(user.clone()),
            role: *role,
            content: content.to_string(),
            created_at: *created_at,
        };
        if let Err(e) = db::insert_message(pool, &message).await {
            panic!("insert failed: {:?}", e);
        }
    }
}

async fn transcript(pool: &DbPool) -> Vec<StoredMessage> {
    match db::list_messages(pool, &SessionId("s1".to_string())).await {
        Ok(m) => m,
        Err(e) => panic!("list_messages failed: {:?}", e),
    }
}

#[tokio::test]
async fn test_send_appends_user_then_assistant() {
    let (_dir, pool) = test_db().await;
    let user = add_user(&pool, "u1").await;
    seed(&pool, &user, &[("old-q", Role::User, "Hi", 10), ("old-a", Role::Assistant, "Hello!", 11)]).await;
    let reconciler = TranscriptReconciler::new(pool.clone());

    let outcome = match reconciler
        .reconcile(&send("s1", &user, "Explain osmosis", "Water moves across membranes."))
        .await
    {
        Ok(o) => o,
        Err(e) => panic!("reconcile failed: {:?}", e),
    };
    assert!(outcome.persisted);

    let messages = transcript(&pool).await;
    let shape: Vec<(Role, &str)> = messages.iter().map(|m| (m.role, m.content.as_str())).collect();
    assert_eq!(
        shape,
        vec![
            (Role::User, "Hi"),
            (Role::Assistant, "Hello!"),
            (Role::User, "Explain osmosis"),
            (Role::Assistant, "Water moves across membranes."),
        ]
    );
    assert_eq!(outcome.user_message_id.as_ref(), Some(&messages[2].id));
    assert_eq!(outcome.assistant_message_id.as_ref(), Some(&messages[3].id));
}

#[tokio::test]
async fn test_edit_replaces_only_the_following_reply() {
    let (_dir, pool) = test_db().await;
    let user = add_user(&pool, "u1").await;
    seed(
        &pool,
        &user,
        &[
            ("q1", Role::User, "What is osmosis", 100),
            ("a1", Role::Assistant, "Old answer", 100),
            ("q2", Role::User, "And diffusion?", 200),
            ("a2", Role::Assistant, "Diffusion answer", 200),
        ],
    )
    .await;
    let reconciler = TranscriptReconciler::new(pool.clone());

    let exchange = Exchange {
        operation: Operation::Edit {
            message_id: MessageId("q1".to_string()),
        },
        ..send("s1", &user, "What is osmosis in plants?", "New answer")
    };
    let outcome = match reconciler.reconcile(&exchange).await {
        Ok(o) => o,
        Err(e) => panic!("reconcile failed: {:?}", e),
    };
    assert_eq!(outcome.user_message_id, Some(MessageId("q1".to_string())));

    let messages = transcript(&pool).await;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].id.0, "q1");
    assert_eq!(messages[0].content, "What is osmosis in plants?");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "New answer");
    assert_ne!(messages[1].id.0, "a1");
    // Later exchange untouched
    assert_eq!(messages[2].id.0, "q2");
    assert_eq!(messages[2].content, "And diffusion?");
    assert_eq!(messages[3].id.0, "a2");
    assert_eq!(messages[3].content, "Diffusion answer");
}

#[tokio::test]
async fn test_edit_without_reply_inserts_one() {
    let (_dir, pool) = test_db().await;
    let user = add_user(&pool, "u1").await;
    seed(&pool, &user, &[("q1", Role::User, "Unanswered", 100)]).await;
    let reconciler = TranscriptReconciler::new(pool.clone());

    let exchange = Exchange {
        operation: Operation::Edit {
            message_id: MessageId("q1".to_string()),
        },
        ..send("s1", &user, "Answered now?", "Yes")
    };
    if let Err(e) = reconciler.reconcile(&exchange).await {
        panic!("reconcile failed: {:?}", e);
    }

    let messages = transcript(&pool).await;
    let shape: Vec<(&str, Role)> = messages.iter().map(|m| (m.content.as_str(), m.role)).collect();
    assert_eq!(shape, vec![("Answered now?", Role::User), ("Yes", Role::Assistant)]);
}

#[tokio::test]
async fn test_edit_of_unknown_message_is_rejected() {
    let (_dir, pool) = test_db().await;
    let user = add_user(&pool, "u1").await;
    seed(&pool, &user, &[("q1", Role::User, "Hi", 100), ("a1", Role::Assistant, "Hello", 100)]).await;
    let reconciler = TranscriptReconciler::new(pool.clone());

    for target in ["missing", "a1"] {
        let exchange = Exchange {
            operation: Operation::Edit {
                message_id: MessageId(target.to_string()),
            },
            ..send("s1", &user, "Edited", "Reply")
        };
        match reconciler.reconcile(&exchange).await {
            Err(e) => assert!(matches!(e.inner, StudyError::NotFound(_))),
            Ok(o) => panic!("Expected NotFound for {}, got {:?}", target, o),
        }
    }
    // Transaction rolled back: nothing changed
    assert_eq!(transcript(&pool).await.len(), 2);
}

#[tokio::test]
async fn test_topic_is_set_from_first_message_only() {
    let (_dir, pool) = test_db().await;
    let user = add_user(&pool, "u1").await;
    let sid = SessionId("s1".to_string());
    if let Err(e) = db::ensure_session(&pool, &sid, &user).await {
        panic!("ensure_session failed: {:?}", e);
    }
    let reconciler = TranscriptReconciler::new(pool.clone());

    let first = match reconciler
        .reconcile(&send("s1", &user, "explain osmosis please", "..."))
        .await
    {
        Ok(o) => o,
        Err(e) => panic!("reconcile failed: {:?}", e),
    };
    assert_eq!(first.title.as_deref(), Some("Explain Osmosis Please"));

    let second = match reconciler
        .reconcile(&send("s1", &user, "now explain mitosis", "..."))
        .await
    {
        Ok(o) => o,
        Err(e) => panic!("reconcile failed: {:?}", e),
    };
    assert_eq!(second.title, None);

    match db::session_topic(&pool, &sid).await {
        Ok(topic) => assert_eq!(topic.as_deref(), Some("Explain Osmosis Please")),
        Err(e) => panic!("session_topic failed: {:?}", e),
    }
}

#[tokio::test]
async fn test_guest_exchange_writes_nothing() {
    let (_dir, pool) = test_db().await;
    let reconciler = TranscriptReconciler::new(pool.clone());
    let exchange = Exchange {
        session_id: SessionId("g1".to_string()),
        mode: Mode::Guest {
            history: Vec::new(),
        },
        operation: Operation::Send,
        user_text: "what is a cell".to_string(),
        assistant_text: "The basic unit of life.".to_string(),
    };

    let outcome = match reconciler.reconcile(&exchange).await {
        Ok(o) => o,
        Err(e) => panic!("reconcile failed: {:?}", e),
    };
    assert!(!outcome.persisted);
    assert_eq!(outcome.title.as_deref(), Some("What Is A Cell"));
    assert_eq!(count_rows(&pool, "sessions").await, 0);
    assert_eq!(count_rows(&pool, "messages").await, 0);
}

#[tokio::test]
async fn test_summarized_titles_fall_back_when_model_is_slow() {
    let (_dir, pool) = test_db().await;
    let user = add_user(&pool, "u1").await;
    let sid = SessionId("s1".to_string());
    let _ = db::ensure_session(&pool, &sid, &user).await;

    let slow = Arc::new(
        ScriptedModel::completing(&["Cell Biology Basics"]).with_complete_delay(Duration::from_millis(500)),
    );
    let reconciler = TranscriptReconciler::new(pool.clone()).with_summarizer(TitleSummarizer {
        model: slow.clone(),
        model_name: "title-model".to_string(),
        step_timeout: Duration::from_millis(50),
    });
    let outcome = match reconciler.reconcile(&send("s1", &user, "tell me about cells", "...")).await {
        Ok(o) => o,
        Err(e) => panic!("reconcile failed: {:?}", e),
    };
    assert_eq!(outcome.title.as_deref(), Some("Tell Me About Cells"));
    assert_eq!(slow.total_calls(), 1);
}

#[tokio::test]
async fn test_summarized_title_is_cleaned() {
    let (_dir, pool) = test_db().await;
    let user = add_user(&pool, "u1").await;
    let _ = db::ensure_session(&pool, &SessionId("s1".to_string()), &user).await;

    let model = Arc::new(ScriptedModel::completing(&["\"Cell Biology Basics\"\n"]));
    let reconciler = TranscriptReconciler::new(pool.clone()).with_summarizer(TitleSummarizer {
        model,
        model_name: "title-model".to_string(),
        step_timeout: Duration::from_secs(2),
    });
    let outcome = match reconciler.reconcile(&send("s1", &user, "tell me about cells", "...")).await {
        Ok(o) => o,
        Err(e) => panic!("reconcile failed: {:?}", e),
    };
    assert_eq!(outcome.title.as_deref(), Some("Cell Biology Basics"));
}
