use crate::import::{parse_batch, ImportError, NewCode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use topup_core::ErrorKind;
use uuid::Uuid;

const MAX_CLAIM_ROUNDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodeStatus {
    Available,
    Reserved,
    Used,
    Disabled,
}

impl CodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeStatus::Available => "AVAILABLE",
            CodeStatus::Reserved => "RESERVED",
            CodeStatus::Used => "USED",
            CodeStatus::Disabled => "DISABLED",
        }
    }
}

impl std::str::FromStr for CodeStatus {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(CodeStatus::Available),
            "RESERVED" => Ok(CodeStatus::Reserved),
            "USED" => Ok(CodeStatus::Used),
            "DISABLED" => Ok(CodeStatus::Disabled),
            other => Err(CodeError::Storage(format!("unknown code status {}", other))),
        }
    }
}

/// One redeemable secret in a code group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Code {
    pub id: Uuid,
    pub group_id: String,
    pub pin: Option<String>,
    pub serial: Option<String>,
    pub cost: f64,
    pub status: CodeStatus,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl Code {
    pub fn new(group_id: &str, new_code: NewCode) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.to_string(),
            pin: new_code.pin,
            serial: new_code.serial,
            cost: new_code.cost,
            status: CodeStatus::Available,
            order_id: None,
            created_at: Utc::now(),
            used_at: None,
        }
    }

    pub fn state(&self) -> CodeState {
        CodeState {
            status: self.status,
            order_id: self.order_id,
        }
    }

    /// Applies a new state, keeping `used_at` consistent with it.
    pub fn apply(&mut self, next: CodeState) {
        self.status = next.status;
        self.order_id = next.order_id;
        match next.status {
            CodeStatus::Used => self.used_at = Some(Utc::now()),
            CodeStatus::Available | CodeStatus::Reserved => self.used_at = None,
            CodeStatus::Disabled => {}
        }
    }
}

/// The part of a code a compare-and-swap matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeState {
    pub status: CodeStatus,
    pub order_id: Option<Uuid>,
}

impl CodeState {
    pub fn available() -> Self {
        Self {
            status: CodeStatus::Available,
            order_id: None,
        }
    }

    pub fn reserved(order_id: Uuid) -> Self {
        Self {
            status: CodeStatus::Reserved,
            order_id: Some(order_id),
        }
    }

    pub fn used(order_id: Uuid) -> Self {
        Self {
            status: CodeStatus::Used,
            order_id: Some(order_id),
        }
    }

    pub fn disabled() -> Self {
        Self {
            status: CodeStatus::Disabled,
            order_id: None,
        }
    }
}

/// Named pool of codes. Inactive groups keep their codes but issue none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeGroup {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl CodeGroup {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub group_id: String,
    pub available: usize,
    pub reserved: usize,
    pub used: usize,
    pub disabled: usize,
}

impl GroupStats {
    pub fn total(&self) -> usize {
        self.available + self.reserved + self.used + self.disabled
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("No available codes left in group {0}")]
    Exhausted(String),

    #[error("Code not found: {0}")]
    NotFound(Uuid),

    #[error("Code {code_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        code_id: Uuid,
        from: CodeStatus,
        to: CodeStatus,
    },

    #[error("Code group not found: {0}")]
    GroupNotFound(String),

    #[error("Code group already exists: {0}")]
    GroupExists(String),

    #[error("Code group {0} is inactive")]
    GroupInactive(String),

    #[error("Invalid code group: {0}")]
    InvalidGroup(String),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error("Code storage failure: {0}")]
    Storage(String),
}

impl CodeError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CodeError::Exhausted(_) | CodeError::GroupInactive(_) => Some(ErrorKind::CodesExhausted),
            CodeError::Import(_) => Some(ErrorKind::MalformedBulkImportLine),
            CodeError::Storage(_) => Some(ErrorKind::Internal),
            CodeError::NotFound(_)
            | CodeError::InvalidTransition { .. }
            | CodeError::GroupNotFound(_)
            | CodeError::GroupExists(_)
            | CodeError::InvalidGroup(_) => None,
        }
    }
}

/// Persistence seam for codes. `compare_and_swap` is the only mutation of an
/// existing code and must be atomic per code.
#[async_trait]
pub trait CodeStore: Send + Sync {
    async fn insert_batch(&self, group_id: &str, codes: Vec<NewCode>) -> Result<Vec<Code>, CodeError>;

    async fn get(&self, id: Uuid) -> Result<Option<Code>, CodeError>;

    async fn list_group(&self, group_id: &str) -> Result<Vec<Code>, CodeError>;

    /// Ids of available codes in the group, oldest first.
    async fn available_candidates(&self, group_id: &str, limit: usize) -> Result<Vec<Uuid>, CodeError>;

    /// Moves the code to `next` only if it currently matches `expected`.
    /// Returns `None` when the code did not match.
    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected: CodeState,
        next: CodeState,
    ) -> Result<Option<Code>, CodeError>;

    /// Stores a new group. Returns `None` when the id is taken.
    async fn create_group(&self, group: CodeGroup) -> Result<Option<CodeGroup>, CodeError>;

    async fn get_group(&self, id: &str) -> Result<Option<CodeGroup>, CodeError>;

    async fn list_groups(&self) -> Result<Vec<CodeGroup>, CodeError>;

    async fn set_group_active(&self, id: &str, active: bool) -> Result<Option<CodeGroup>, CodeError>;
}

/// Code store kept in process memory, one mutex per code.
pub struct InMemoryCodeStore {
    codes: RwLock<HashMap<Uuid, Arc<Mutex<Code>>>>,
    members: RwLock<HashMap<String, Vec<Uuid>>>,
    groups: RwLock<HashMap<String, CodeGroup>>,
}

impl InMemoryCodeStore {
    pub fn new() -> Self {
        Self {
            codes: RwLock::new(HashMap::new()),
            members: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, id: Uuid) -> Option<Arc<Mutex<Code>>> {
        self.codes.read().await.get(&id).cloned()
    }

    async fn group_slots(&self, group_id: &str) -> Vec<Arc<Mutex<Code>>> {
        let ids = self
            .members
            .read()
            .await
            .get(group_id)
            .cloned()
            .unwrap_or_default();
        let codes = self.codes.read().await;
        ids.iter().filter_map(|id| codes.get(id).cloned()).collect()
    }
}

impl Default for InMemoryCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(slot: &Mutex<Code>) -> Code {
    slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
}

#[async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn insert_batch(&self, group_id: &str, codes: Vec<NewCode>) -> Result<Vec<Code>, CodeError> {
        let created: Vec<Code> = codes.into_iter().map(|c| Code::new(group_id, c)).collect();
        let mut all = self.codes.write().await;
        let mut members = self.members.write().await;
        let members = members.entry(group_id.to_string()).or_default();
        for code in &created {
            all.insert(code.id, Arc::new(Mutex::new(code.clone())));
            members.push(code.id);
        }
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Code>, CodeError> {
        Ok(self.slot(id).await.map(|slot| snapshot(&slot)))
    }

    async fn list_group(&self, group_id: &str) -> Result<Vec<Code>, CodeError> {
        Ok(self
            .group_slots(group_id)
            .await
            .iter()
            .map(|slot| snapshot(slot))
            .collect())
    }

    async fn available_candidates(&self, group_id: &str, limit: usize) -> Result<Vec<Uuid>, CodeError> {
        Ok(self
            .group_slots(group_id)
            .await
            .iter()
            .map(|slot| snapshot(slot))
            .filter(|code| code.status == CodeStatus::Available)
            .take(limit)
            .map(|code| code.id)
            .collect())
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        expected: CodeState,
        next: CodeState,
    ) -> Result<Option<Code>, CodeError> {
        let slot = self.slot(id).await.ok_or(CodeError::NotFound(id))?;
        let mut code = slot.lock().unwrap_or_else(|p| p.into_inner());
        if code.state() != expected {
            return Ok(None);
        }
        code.apply(next);
        Ok(Some(code.clone()))
    }

    async fn create_group(&self, group: CodeGroup) -> Result<Option<CodeGroup>, CodeError> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&group.id) {
            return Ok(None);
        }
        groups.insert(group.id.clone(), group.clone());
        Ok(Some(group))
    }

    async fn get_group(&self, id: &str) -> Result<Option<CodeGroup>, CodeError> {
        Ok(self.groups.read().await.get(id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<CodeGroup>, CodeError> {
        let mut groups: Vec<CodeGroup> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(groups)
    }

    async fn set_group_active(&self, id: &str, active: bool) -> Result<Option<CodeGroup>, CodeError> {
        let mut groups = self.groups.write().await;
        Ok(groups.get_mut(id).map(|group| {
            group.is_active = active;
            group.clone()
        }))
    }
}

/// Issues codes from a group without double-issue.
pub struct CodeAllocator {
    store: Arc<dyn CodeStore>,
    candidate_batch: usize,
}

impl CodeAllocator {
    pub fn new(store: Arc<dyn CodeStore>, candidate_batch: usize) -> Self {
        Self {
            store,
            candidate_batch: candidate_batch.max(1),
        }
    }

    pub fn store(&self) -> Arc<dyn CodeStore> {
        self.store.clone()
    }

    pub async fn create_group(&self, id: &str, name: &str) -> Result<CodeGroup, CodeError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(CodeError::InvalidGroup("group id is required".into()));
        }
        let name = match name.trim() {
            "" => id,
            name => name,
        };
        let created = self
            .store
            .create_group(CodeGroup::new(id, name))
            .await?
            .ok_or_else(|| CodeError::GroupExists(id.to_string()))?;
        tracing::info!("Created code group {}", created.id);
        Ok(created)
    }

    pub async fn group(&self, group_id: &str) -> Result<CodeGroup, CodeError> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| CodeError::GroupNotFound(group_id.to_string()))
    }

    pub async fn list_groups(&self) -> Result<Vec<CodeGroup>, CodeError> {
        self.store.list_groups().await
    }

    /// Flips the group between active and inactive.
    pub async fn toggle_group(&self, group_id: &str) -> Result<CodeGroup, CodeError> {
        let current = self.group(group_id).await?;
        let toggled = self
            .store
            .set_group_active(group_id, !current.is_active)
            .await?
            .ok_or_else(|| CodeError::GroupNotFound(group_id.to_string()))?;
        tracing::info!(
            "Code group {} is now {}",
            group_id,
            if toggled.is_active { "active" } else { "inactive" }
        );
        Ok(toggled)
    }

    /// Reserves one available code for the order. Lost races move on to the
    /// next candidate; exhaustion is reported only when none remain, or when
    /// every round lost its race.
    pub async fn claim(&self, group_id: &str, order_id: Uuid) -> Result<Code, CodeError> {
        let group = self.group(group_id).await?;
        if !group.is_active {
            return Err(CodeError::GroupInactive(group.id));
        }
        for _ in 0..MAX_CLAIM_ROUNDS {
            let candidates = self
                .store
                .available_candidates(group_id, self.candidate_batch)
                .await?;
            if candidates.is_empty() {
                tracing::warn!("Code group {} exhausted (order {})", group_id, order_id);
                return Err(CodeError::Exhausted(group_id.to_string()));
            }
            for id in candidates {
                let swapped = self
                    .store
                    .compare_and_swap(id, CodeState::available(), CodeState::reserved(order_id))
                    .await?;
                match swapped {
                    Some(code) => {
                        tracing::debug!("Reserved code {} for order {}", code.id, order_id);
                        return Ok(code);
                    }
                    None => tracing::debug!("Claim conflict on code {}, trying next", id),
                }
            }
        }
        tracing::warn!(
            "Code group {} kept losing claim races (order {}), reporting exhausted",
            group_id,
            order_id
        );
        Err(CodeError::Exhausted(group_id.to_string()))
    }

    /// Fails unless the code is reserved by, or already used by, `order_id`.
    pub async fn check_commit(&self, code_id: Uuid, order_id: Uuid) -> Result<Code, CodeError> {
        let current = self.current(code_id).await?;
        match (current.status, current.order_id) {
            (CodeStatus::Reserved | CodeStatus::Used, Some(owner)) if owner == order_id => Ok(current),
            (from, _) => Err(CodeError::InvalidTransition {
                code_id,
                from,
                to: CodeStatus::Used,
            }),
        }
    }

    /// Reserved by `order_id` to Used. Committing a code this order already
    /// used is a no-op.
    pub async fn commit(&self, code_id: Uuid, order_id: Uuid) -> Result<Code, CodeError> {
        let committed = self
            .store
            .compare_and_swap(code_id, CodeState::reserved(order_id), CodeState::used(order_id))
            .await?;
        match committed {
            Some(code) => Ok(code),
            None => {
                let current = self.current(code_id).await?;
                if current.state() == CodeState::used(order_id) {
                    return Ok(current);
                }
                Err(CodeError::InvalidTransition {
                    code_id,
                    from: current.status,
                    to: CodeStatus::Used,
                })
            }
        }
    }

    /// Undoes a commit made earlier in the same approval.
    pub async fn revert_commit(&self, code_id: Uuid, order_id: Uuid) -> Result<Code, CodeError> {
        let reverted = self
            .store
            .compare_and_swap(code_id, CodeState::used(order_id), CodeState::reserved(order_id))
            .await?;
        match reverted {
            Some(code) => Ok(code),
            None => Err(self.transition_error(code_id, CodeStatus::Reserved).await),
        }
    }

    /// Reserved back to Available.
    pub async fn release(&self, code_id: Uuid) -> Result<Code, CodeError> {
        let current = self.current(code_id).await?;
        if current.status != CodeStatus::Reserved {
            return Err(CodeError::InvalidTransition {
                code_id,
                from: current.status,
                to: CodeStatus::Available,
            });
        }
        let released = self
            .store
            .compare_and_swap(code_id, current.state(), CodeState::available())
            .await?;
        match released {
            Some(code) => {
                tracing::debug!("Released code {}", code_id);
                Ok(code)
            }
            None => Err(self.transition_error(code_id, CodeStatus::Available).await),
        }
    }

    /// Available or Reserved to Disabled. Disabling twice is a no-op.
    pub async fn disable(&self, code_id: Uuid) -> Result<Code, CodeError> {
        loop {
            let current = self.current(code_id).await?;
            match current.status {
                CodeStatus::Disabled => return Ok(current),
                CodeStatus::Used => {
                    return Err(CodeError::InvalidTransition {
                        code_id,
                        from: CodeStatus::Used,
                        to: CodeStatus::Disabled,
                    })
                }
                CodeStatus::Available | CodeStatus::Reserved => {
                    let disabled = self
                        .store
                        .compare_and_swap(code_id, current.state(), CodeState::disabled())
                        .await?;
                    if let Some(code) = disabled {
                        tracing::info!("Disabled code {} in group {}", code_id, code.group_id);
                        return Ok(code);
                    }
                }
            }
        }
    }

    /// Parses and stores a batch; nothing is stored if any line is malformed.
    pub async fn add_codes(
        &self,
        group_id: &str,
        raw: &str,
        default_cost: Option<f64>,
    ) -> Result<Vec<Code>, CodeError> {
        self.group(group_id).await?;
        let parsed = parse_batch(raw, default_cost)?;
        let created = self.store.insert_batch(group_id, parsed).await?;
        tracing::info!("Added {} codes to group {}", created.len(), group_id);
        Ok(created)
    }

    pub async fn list_group(&self, group_id: &str) -> Result<Vec<Code>, CodeError> {
        self.store.list_group(group_id).await
    }

    pub async fn group_stats(&self, group_id: &str) -> Result<GroupStats, CodeError> {
        let mut stats = GroupStats {
            group_id: group_id.to_string(),
            ..Default::default()
        };
        for code in self.store.list_group(group_id).await? {
            match code.status {
                CodeStatus::Available => stats.available += 1,
                CodeStatus::Reserved => stats.reserved += 1,
                CodeStatus::Used => stats.used += 1,
                CodeStatus::Disabled => stats.disabled += 1,
            }
        }
        Ok(stats)
    }

    async fn current(&self, code_id: Uuid) -> Result<Code, CodeError> {
        self.store
            .get(code_id)
            .await?
            .ok_or(CodeError::NotFound(code_id))
    }

    async fn transition_error(&self, code_id: Uuid, to: CodeStatus) -> CodeError {
        match self.current(code_id).await {
            Ok(code) => CodeError::InvalidTransition {
                code_id,
                from: code.status,
                to,
            },
            Err(e) => e,
        }
    }
}
