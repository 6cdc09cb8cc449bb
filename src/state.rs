// src/state.rs
use std::sync::Arc;

use crate::services::completions::CompletionsClient;
use crate::services::page::IndexPage;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub completions: CompletionsClient,
    pub index_page: IndexPage,
}

impl AppState {
    pub fn new(completions: CompletionsClient, index_page: IndexPage) -> Self {
        Self {
            completions,
            index_page,
        }
    }
}
