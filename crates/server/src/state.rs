use bsds::provider::ArrivalProvider;
use std::sync::Arc;

pub struct AppState {
    pub provider: Arc<ArrivalProvider>,
}

impl AppState {
    pub fn new(provider: Arc<ArrivalProvider>) -> Self {
        Self { provider }
    }
}
