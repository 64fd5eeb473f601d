//! Persistent storage for offices and tokens
//!
//! The engine talks to storage through the [`TokenStore`] and [`OfficeStore`]
//! traits. Two implementations are included:
//! - [`MemoryStorage`]: in-process maps, nothing survives a restart
//! - [`LocalStorage`]: the same maps mirrored to JSON files in a directory

use crate::error::{QueueError, Result};
use crate::model::{CapacityUpdate, Office, OfficeId, PauseState, Token, TokenId, TokenStatus, TokenUpdate};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;

/// Token records
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetch a token by id, terminal or not
    async fn get_token(&self, id: &str) -> Result<Option<Token>>;

    /// Non-terminal tokens of an office in FIFO order
    async fn list_active_for_office(&self, office_id: &str) -> Result<Vec<Token>>;

    /// Insert a new token
    async fn insert_token(&self, token: Token) -> Result<()>;

    /// Partial update of status and timing fields; returns the stored token.
    ///
    /// Fails with `InvalidTransition` when the token is terminal, except for
    /// the NO_SHOW -> WAIT re-queue.
    async fn update_token(&self, id: &str, update: TokenUpdate) -> Result<Token>;

    /// Apply several partial updates in one storage round trip.
    ///
    /// The default applies them one by one and stops at the first failure.
    /// The bundled stores apply all or none.
    async fn update_tokens(&self, updates: Vec<(TokenId, TokenUpdate)>) -> Result<Vec<Token>> {
        let mut tokens = Vec::with_capacity(updates.len());
        for (id, update) in updates {
            tokens.push(self.update_token(&id, update).await?);
        }
        Ok(tokens)
    }

    /// Reserve the next per-office token number
    async fn next_token_number(&self, office_id: &str) -> Result<u32>;
}

/// Office records
#[async_trait]
pub trait OfficeStore: Send + Sync {
    async fn get_office(&self, id: &str) -> Result<Option<Office>>;

    async fn insert_office(&self, office: Office) -> Result<()>;

    async fn update_capacity_config(&self, id: &str, config: CapacityUpdate) -> Result<Office>;

    async fn update_pause_state(&self, id: &str, pause: PauseState) -> Result<Office>;
}

/// Combined storage backend used by the manager
pub trait Storage: TokenStore + OfficeStore {}

impl<T: TokenStore + OfficeStore> Storage for T {}

/// Shared in-memory state behind both implementations
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    offices: HashMap<OfficeId, Office>,
    tokens: HashMap<TokenId, Token>,
    /// Last issued token number per office
    sequences: HashMap<OfficeId, u32>,
}

impl StoreState {
    fn active_for_office(&self, office_id: &str) -> Vec<Token> {
        let mut tokens: Vec<Token> = self
            .tokens
            .values()
            .filter(|t| t.office_id == office_id && !t.is_terminal())
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.fifo_key());
        tokens
    }

    fn insert_token(&mut self, token: Token) -> Result<()> {
        if self.tokens.contains_key(&token.id) {
            return Err(QueueError::Storage(format!(
                "token {} already exists",
                token.id
            )));
        }
        // Keep the sequence ahead of externally numbered inserts
        let seq = self.sequences.entry(token.office_id.clone()).or_insert(0);
        *seq = (*seq).max(token.token_number);
        self.tokens.insert(token.id.clone(), token);
        Ok(())
    }

    fn check_update(&self, id: &str, update: &TokenUpdate) -> Result<()> {
        let token = self
            .tokens
            .get(id)
            .ok_or_else(|| QueueError::TokenNotFound(id.to_string()))?;

        let requeue = token.status == TokenStatus::NoShow && update.status == Some(TokenStatus::Wait);
        if token.is_terminal() && !requeue {
            return Err(QueueError::InvalidTransition {
                token_id: id.to_string(),
                from: token.status,
                action: "update",
            });
        }
        Ok(())
    }

    fn update_token(&mut self, id: &str, update: &TokenUpdate) -> Result<Token> {
        self.check_update(id, update)?;
        let token = self
            .tokens
            .get_mut(id)
            .ok_or_else(|| QueueError::TokenNotFound(id.to_string()))?;
        update.apply_to(token, Utc::now());
        Ok(token.clone())
    }

    /// All updates are checked before any is applied
    fn update_tokens(&mut self, updates: &[(TokenId, TokenUpdate)]) -> Result<Vec<Token>> {
        for (id, update) in updates {
            self.check_update(id, update)?;
        }
        updates
            .iter()
            .map(|(id, update)| self.update_token(id, update))
            .collect()
    }

    fn next_token_number(&mut self, office_id: &str) -> u32 {
        if !self.sequences.contains_key(office_id) {
            let max = self
                .tokens
                .values()
                .filter(|t| t.office_id == office_id)
                .map(|t| t.token_number)
                .max()
                .unwrap_or(0);
            self.sequences.insert(office_id.to_string(), max);
        }
        let seq = self.sequences.entry(office_id.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn office_mut(&mut self, id: &str) -> Result<&mut Office> {
        self.offices
            .get_mut(id)
            .ok_or_else(|| QueueError::OfficeNotFound(id.to_string()))
    }

    fn insert_office(&mut self, office: Office) -> Result<()> {
        if self.offices.contains_key(&office.id) {
            return Err(QueueError::Storage(format!(
                "office {} already exists",
                office.id
            )));
        }
        self.offices.insert(office.id.clone(), office);
        Ok(())
    }

    fn update_capacity_config(&mut self, id: &str, config: CapacityUpdate) -> Result<Office> {
        let office = self.office_mut(id)?;
        office.counter_count = config.counter_count;
        office.max_allocated = config.max_allocated;
        if let Some(minutes) = config.avg_service_minutes {
            office.avg_service_minutes = minutes;
        }
        office.updated_at = Utc::now();
        Ok(office.clone())
    }

    fn update_pause_state(&mut self, id: &str, pause: PauseState) -> Result<Office> {
        let office = self.office_mut(id)?;
        office.pause = pause;
        office.updated_at = Utc::now();
        Ok(office.clone())
    }
}

/// In-memory storage
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<StoreState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryStorage {
    async fn get_token(&self, id: &str) -> Result<Option<Token>> {
        Ok(self.state.read().await.tokens.get(id).cloned())
    }

    async fn list_active_for_office(&self, office_id: &str) -> Result<Vec<Token>> {
        Ok(self.state.read().await.active_for_office(office_id))
    }

    async fn insert_token(&self, token: Token) -> Result<()> {
        self.state.write().await.insert_token(token)
    }

    async fn update_token(&self, id: &str, update: TokenUpdate) -> Result<Token> {
        self.state.write().await.update_token(id, &update)
    }

    async fn update_tokens(&self, updates: Vec<(TokenId, TokenUpdate)>) -> Result<Vec<Token>> {
        self.state.write().await.update_tokens(&updates)
    }

    async fn next_token_number(&self, office_id: &str) -> Result<u32> {
        Ok(self.state.write().await.next_token_number(office_id))
    }
}

#[async_trait]
impl OfficeStore for MemoryStorage {
    async fn get_office(&self, id: &str) -> Result<Option<Office>> {
        Ok(self.state.read().await.offices.get(id).cloned())
    }

    async fn insert_office(&self, office: Office) -> Result<()> {
        self.state.write().await.insert_office(office)
    }

    async fn update_capacity_config(&self, id: &str, config: CapacityUpdate) -> Result<Office> {
        self.state.write().await.update_capacity_config(id, config)
    }

    async fn update_pause_state(&self, id: &str, pause: PauseState) -> Result<Office> {
        self.state.write().await.update_pause_state(id, pause)
    }
}

/// Local filesystem-based storage implementation
pub struct LocalStorage {
    /// Directory path for storage files
    storage_dir: PathBuf,
    /// In-memory cache (for fast access)
    state: RwLock<StoreState>,
}

impl LocalStorage {
    /// Create a new LocalStorage with the specified directory
    ///
    /// The directory will be created if it doesn't exist.
    pub async fn new(storage_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&storage_dir)
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to create storage directory: {}", e)))?;

        let storage = Self {
            storage_dir,
            state: RwLock::new(StoreState::default()),
        };

        storage.load_from_disk().await?;

        Ok(storage)
    }

    fn offices_path(&self) -> PathBuf {
        self.storage_dir.join("offices.json")
    }

    fn tokens_path(&self) -> PathBuf {
        self.storage_dir.join("tokens.json")
    }

    fn sequences_path(&self) -> PathBuf {
        self.storage_dir.join("sequences.json")
    }

    /// Load data from disk into memory
    async fn load_from_disk(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(offices) = read_json::<Vec<Office>>(&self.offices_path()).await? {
            state.offices = offices.into_iter().map(|o| (o.id.clone(), o)).collect();
        }
        if let Some(tokens) = read_json::<Vec<Token>>(&self.tokens_path()).await? {
            state.tokens = tokens.into_iter().map(|t| (t.id.clone(), t)).collect();
        }
        if let Some(sequences) = read_json::<HashMap<OfficeId, u32>>(&self.sequences_path()).await? {
            state.sequences = sequences;
        }

        tracing::debug!(
            offices = state.offices.len(),
            tokens = state.tokens.len(),
            dir = %self.storage_dir.display(),
            "a3s.queue.storage: loaded state"
        );
        Ok(())
    }

    async fn persist(&self, files: Files, state: &StoreState) -> Result<()> {
        match files {
            Files::Offices => {
                let offices: Vec<&Office> = state.offices.values().collect();
                write_json(&self.offices_path(), &offices).await
            }
            Files::Tokens => {
                let tokens: Vec<&Token> = state.tokens.values().collect();
                write_json(&self.tokens_path(), &tokens).await?;
                write_json(&self.sequences_path(), &state.sequences).await
            }
            Files::Sequences => write_json(&self.sequences_path(), &state.sequences).await,
        }
    }

    /// Apply `change` to a copy of the state and swap it in only once it is on disk
    async fn commit<T, F>(&self, files: Files, change: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut StoreState) -> Result<T> + Send,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let value = change(&mut next)?;
        self.persist(files, &next).await?;
        *state = next;
        Ok(value)
    }
}

/// Which files a change has to rewrite
#[derive(Debug, Clone, Copy)]
enum Files {
    Offices,
    Tokens,
    Sequences,
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(data) => serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| QueueError::Storage(format!("Corrupt file {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(QueueError::Storage(format!(
            "Failed to read {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Write to a sibling temp file, then rename over the target
async fn write_json<T: Serialize + ?Sized>(path: &PathBuf, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| QueueError::Storage(format!("Failed to serialize: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)
        .await
        .map_err(|e| QueueError::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| QueueError::Storage(format!("Failed to replace {}: {}", path.display(), e)))
}

#[async_trait]
impl TokenStore for LocalStorage {
    async fn get_token(&self, id: &str) -> Result<Option<Token>> {
        Ok(self.state.read().await.tokens.get(id).cloned())
    }

    async fn list_active_for_office(&self, office_id: &str) -> Result<Vec<Token>> {
        Ok(self.state.read().await.active_for_office(office_id))
    }

    async fn insert_token(&self, token: Token) -> Result<()> {
        self.commit(Files::Tokens, move |state| state.insert_token(token))
            .await
    }

    async fn update_token(&self, id: &str, update: TokenUpdate) -> Result<Token> {
        self.commit(Files::Tokens, move |state| state.update_token(id, &update))
            .await
    }

    async fn update_tokens(&self, updates: Vec<(TokenId, TokenUpdate)>) -> Result<Vec<Token>> {
        self.commit(Files::Tokens, move |state| state.update_tokens(&updates))
            .await
    }

    async fn next_token_number(&self, office_id: &str) -> Result<u32> {
        self.commit(Files::Sequences, |state| Ok(state.next_token_number(office_id)))
            .await
    }
}

#[async_trait]
impl OfficeStore for LocalStorage {
    async fn get_office(&self, id: &str) -> Result<Option<Office>> {
        Ok(self.state.read().await.offices.get(id).cloned())
    }

    async fn insert_office(&self, office: Office) -> Result<()> {
        self.commit(Files::Offices, move |state| state.insert_office(office))
            .await
    }

    async fn update_capacity_config(&self, id: &str, config: CapacityUpdate) -> Result<Office> {
        self.commit(Files::Offices, move |state| state.update_capacity_config(id, config))
            .await
    }

    async fn update_pause_state(&self, id: &str, pause: PauseState) -> Result<Office> {
        self.commit(Files::Offices, move |state| state.update_pause_state(id, pause))
            .await
    }
}
