pub mod billing;
pub mod chat;
pub mod clock;
pub mod notifier;
pub mod settings;
pub mod timers;

pub use chat::{ChatConfig, ChatService, TickOutcome};
pub use clock::{Clock, SystemClock, TokioClock};
pub use notifier::{BroadcastNotifier, EventDispatcher, Notifier, PushSender};
pub use settings::{FixedSettings, PgSettingsProvider, SettingsProvider};
