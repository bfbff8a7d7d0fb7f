use crate::config::Settings;
use crate::events::Notifier;
use crate::host::BridgeHost;
use crate::tasks::ControllerHandle;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub controller: ControllerHandle,
    pub bridge: Arc<BridgeHost>,
    pub notifier: Notifier,
}
