use std::sync::Arc;
use std::time::Duration;

use murmur::chat::{Collaborators, HeadlessSurface, NodeKey, RETRACTED_PLACEHOLDER, RenderNode, StickerLookup};
use murmur::{ChatRuntime, ChatSettings};
use murmur_storage::{Direction, MessageKind, NewConversation};

struct CatStickers;

impl StickerLookup for CatStickers {
    fn resolve(&self, sticker_sets: &[String], name: &str) -> Option<String> {
        sticker_sets
            .iter()
            .any(|set| set == "cats")
            .then(|| format!("cats/{name}.png"))
    }
}

fn runtime_with(settings: ChatSettings) -> ChatRuntime {
    ChatRuntime::in_memory(
        settings,
        Collaborators::local().with_stickers(Arc::new(CatStickers)),
    )
}

#[tokio::test(start_paused = true)]
async fn reply_is_paced_into_history_and_rendered_in_order() {
    let runtime = runtime_with(ChatSettings::default());
    let conversation = runtime.create_conversation(
        NewConversation::with_participant("Mio").with_sticker_sets(vec!["cats".to_string()]),
    );
    let view = runtime
        .open_view(conversation.id(), HeadlessSurface::default())
        .expect("open view");

    runtime
        .send_user_message(conversation.id(), "good morning")
        .expect("send");
    let ticket = runtime
        .ingest(
            conversation.id(),
            "[MSG1]morning![/MSG1]【表情包】wave【/表情包】[MSG2]sleep well?[/MSG2]",
        )
        .expect("ingest");
    assert_eq!(ticket.scheduled, 3);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(conversation.len(), 2, "only the first record is due immediately");

    assert_eq!(ticket.delivered().await, 3);
    view.lock().on_frame();

    let records = conversation.list();
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].direction, Direction::Outbound);
    assert!(matches!(records[2].kind, MessageKind::Sticker { .. }));
    assert!(records.iter().all(|record| record.read));
    assert!(
        records[1..]
            .windows(2)
            .all(|pair| pair[0].created_at_unix_ms < pair[1].created_at_unix_ms)
    );
    let round = records[1].round_id;
    assert!(round.is_some());
    assert!(records[1..].iter().all(|record| record.round_id == round));

    let view = view.lock();
    let ids = view.renderer().surface().message_ids();
    assert_eq!(ids, records.iter().map(|record| record.id).collect::<Vec<_>>());
    let dump = view.renderer().surface().dump();
    assert!(dump.contains("> good morning"));
    assert!(dump.contains("< Mio: morning!"));
    assert!(dump.contains("[Sticker: wave]"));
    assert!(view.renderer().is_following_bottom());
}

#[tokio::test(start_paused = true)]
async fn retraction_updates_the_rendered_bubble_in_place() {
    let runtime = runtime_with(ChatSettings::default());
    let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
    let view = runtime
        .open_view(conversation.id(), HeadlessSurface::default())
        .expect("open view");
    let sent = runtime
        .send_user_message(conversation.id(), "oops, wrong chat")
        .expect("send");

    let ticket = runtime
        .ingest(conversation.id(), &format!("【撤回】{}【/撤回】", sent.id))
        .expect("ingest");
    ticket.delivered().await;

    let records = conversation.list();
    assert_eq!(records[0].id, sent.id);
    assert!(records[0].kind.is_retracted());
    assert_eq!(records[1].kind.summary(), "Mio retracted one of your messages");

    let view = view.lock();
    match view.renderer().surface().node(NodeKey::Message(sent.id)) {
        Some(RenderNode::Message(bubble)) => assert_eq!(bubble.text, RETRACTED_PLACEHOLDER),
        other => panic!("retracted bubble missing: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn long_history_opens_windowed_and_loads_earlier_batches() {
    let mut settings = ChatSettings::default();
    settings.render.batch_size = 5;
    settings.render.buffer_size = 2;
    let runtime = runtime_with(settings);
    let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
    for index in 0..12 {
        runtime
            .send_user_message(conversation.id(), &format!("note {index}"))
            .expect("send");
    }

    let view = runtime
        .open_view(conversation.id(), HeadlessSurface::default())
        .expect("open view");
    let mut view = view.lock();
    view.on_frame();
    assert_eq!(view.scroll_state().start_offset, 7);
    assert!(view.renderer().surface().node(NodeKey::LoadMore).is_some());

    assert!(view.load_more());
    view.on_frame();
    assert_eq!(view.scroll_state().start_offset, 2);
    assert!(view.load_more());
    view.on_frame();
    assert_eq!(view.scroll_state().start_offset, 0);
    assert!(view.renderer().surface().node(NodeKey::LoadMore).is_none());
    assert_eq!(view.renderer().surface().message_ids().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn switching_away_leaves_later_deliveries_unread() {
    let runtime = runtime_with(ChatSettings::default());
    let conversation = runtime.create_conversation(NewConversation::with_participant("Mio"));
    let _view = runtime
        .open_view(conversation.id(), HeadlessSurface::default())
        .expect("open view");

    let ticket = runtime
        .ingest(conversation.id(), "first\n\nsecond\n\nthird")
        .expect("ingest");
    tokio::time::sleep(Duration::from_millis(1)).await;
    runtime.close_view(conversation.id());
    ticket.delivered().await;

    let records = conversation.list();
    assert_eq!(records.len(), 3);
    assert!(records[0].read);
    assert!(!records[2].read);
    assert_eq!(conversation.unread_count(), 2);
}
