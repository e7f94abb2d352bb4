/// External systems the chat core calls into.
pub mod collaborators;
/// Directive actions turned into history updates and planned records.
pub mod dispatcher;
pub mod interaction;
pub mod pipeline;
pub mod renderer;
pub mod scroll_manager;
/// Timed delivery of planned records.
pub mod sequencer;
pub mod surface;
pub mod view;

pub use collaborators::{
    CallSubsystem, CoListening, CollaboratorError, CollaboratorResult, Collaborators,
    ListenState, LocalLedger, LocalListening, LoggedCalls, LoggedNotices, ModelCall, NoModel,
    NoStickers, NoTranslator, NoticeSink, PaymentLedger, PendingInvite, StickerLookup,
    Translator,
};
pub use dispatcher::{ActionDispatcher, Dispatch, PlannedRecord, is_open_card};
pub use interaction::{
    HitTarget, InteractionConfig, InteractionDelegate, InteractionEffect, LayoutProbe, MenuItem,
    MenuPlacement, PointerEvent, PointerPhase, place_menu,
};
pub use pipeline::{PlannedRound, ResponsePipeline};
pub use renderer::{RenderConfig, VirtualScrollState, WindowedRenderer};
pub use scroll_manager::{AUTO_FOLLOW_RESUME_THRESHOLD, ScrollManager};
pub use sequencer::{DeliveryObserver, MessageSequencer, Offscreen, ScheduledEntry};
pub use surface::{
    BubbleStyle, BubbleView, ElementRect, HeadlessSurface, NodeKey, RETRACTED_PLACEHOLDER,
    RenderNode, RenderSurface, ScrollMetrics, SurfaceError, SurfaceResult,
};
pub use view::{ConversationView, DeliveryTarget, ViewError, ViewResult};
