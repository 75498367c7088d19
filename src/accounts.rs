//! Account lifecycle and the live-account list.
//!
//! An account is one `(provider, username)` binding. The list is
//! single-writer: every mutation happens inside the manager's mutex, and the
//! monotonic version counter totally orders racing auth flows so a newly
//! created account replaces any older duplicate in the same transaction that
//! makes it visible.

use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{AuthManager, AuthToken, TokenSink};
use crate::config::ITEM_CACHE_CAPACITY;
use crate::error::Result;
use crate::http_client::{HttpClient, link_tokens};
use crate::provider::{AccountId, Item, Provider, ProviderKind, get_item_by_path};
use crate::providers::CloudFactory;
use crate::stream_cache::{CoalescedCache, ValueFetcher};
use crate::token_store::{StoredToken, TokenStore};

/// Notified on account creation and removal.
pub trait AccountListener: Send + Sync {
    fn on_create(&self, account: &Account);
    fn on_destroy(&self, account: &Account);
}

/// Default listener logging lifecycle transitions.
pub struct LogListener;

impl AccountListener for LogListener {
    fn on_create(&self, account: &Account) {
        info!(account = %account.account_id(), "account created");
    }

    fn on_destroy(&self, account: &Account) {
        info!(account = %account.account_id(), "account removed");
    }
}

/// Persists refreshed tokens once the account's username is known.
struct StoreSink {
    store: Arc<TokenStore>,
    kind: ProviderKind,
    username: Arc<RwLock<Option<String>>>,
}

#[async_trait::async_trait]
impl TokenSink for StoreSink {
    async fn persist(&self, token: &AuthToken) -> Result<()> {
        let username = self.username.read().unwrap().clone();
        match username {
            Some(username) => self.store.save(self.kind, &username, token).await,
            // Still provisioning; the create transaction persists on success.
            None => Ok(()),
        }
    }
}

/// Resolves proxy paths through the provider, shared by concurrent requests.
struct PathResolver {
    provider: Arc<dyn Provider>,
}

#[async_trait::async_trait]
impl ValueFetcher<Item> for PathResolver {
    async fn fetch(&self, path: &str, cancel: &CancellationToken) -> Result<Item> {
        get_item_by_path(&*self.provider, path, cancel).await
    }
}

pub struct Account {
    pub kind: ProviderKind,
    pub version: u64,
    username: Arc<RwLock<Option<String>>>,
    pub provider: Arc<dyn Provider>,
    pub auth: Arc<AuthManager>,
    pub cancel: CancellationToken,
    path_cache: CoalescedCache<Item>,
}

impl Account {
    fn new(
        kind: ProviderKind,
        version: u64,
        username: Arc<RwLock<Option<String>>>,
        provider: Arc<dyn Provider>,
        auth: Arc<AuthManager>,
        cancel: CancellationToken,
    ) -> Self {
        let path_cache = CoalescedCache::new(
            ITEM_CACHE_CAPACITY,
            Arc::new(PathResolver {
                provider: provider.clone(),
            }),
            cancel.clone(),
        );
        Self {
            kind,
            version,
            username,
            provider,
            auth,
            cancel,
            path_cache,
        }
    }

    pub fn username(&self) -> String {
        self.username.read().unwrap().clone().unwrap_or_default()
    }

    pub fn account_id(&self) -> AccountId {
        AccountId::new(self.kind, self.username())
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.username.read().unwrap().is_some()
    }

    /// Path resolution memoised per account; concurrent requests for the
    /// same path share one walk.
    pub async fn resolve_path(&self, path: &str, cancel: &CancellationToken) -> Result<Item> {
        self.path_cache.get(path, cancel).await
    }

    /// Drop memoised entries invalidated by a mutation at `path`.
    pub fn invalidate_path(&self, path: &str) {
        self.path_cache.invalidate(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.path_cache.invalidate(parent);
        }
        self.path_cache.invalidate("");
    }
}

struct State {
    accounts: Vec<Arc<Account>>,
    next_version: u64,
}

pub struct AccountManager {
    http: Arc<dyn HttpClient>,
    factory: CloudFactory,
    token_store: Arc<TokenStore>,
    listener: Box<dyn AccountListener>,
    state: tokio::sync::Mutex<State>,
}

impl AccountManager {
    pub fn new(
        http: Arc<dyn HttpClient>,
        factory: CloudFactory,
        token_store: Arc<TokenStore>,
        listener: Box<dyn AccountListener>,
    ) -> Self {
        Self {
            http,
            factory,
            token_store,
            listener,
            state: tokio::sync::Mutex::new(State {
                accounts: Vec::new(),
                next_version: 0,
            }),
        }
    }

    pub fn factory(&self) -> &CloudFactory {
        &self.factory
    }

    pub async fn accounts(&self) -> Vec<Arc<Account>> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn find(&self, id: &AccountId) -> Option<Arc<Account>> {
        self.state
            .lock()
            .await
            .accounts
            .iter()
            .find(|account| account.is_active() && &account.account_id() == id)
            .cloned()
    }

    fn build_account(
        &self,
        state: &mut State,
        kind: ProviderKind,
        token: AuthToken,
        username: Arc<RwLock<Option<String>>>,
    ) -> Arc<Account> {
        let version = state.next_version;
        state.next_version += 1;
        let cancel = CancellationToken::new();
        let sink = Arc::new(StoreSink {
            store: self.token_store.clone(),
            kind,
            username: username.clone(),
        });
        let auth = Arc::new(AuthManager::new(
            self.http.clone(),
            kind,
            self.factory.auth_data(kind),
            token,
            sink,
        ));
        let provider = self.factory.create(kind, auth.clone(), &cancel);
        let account = Arc::new(Account::new(kind, version, username, provider, auth, cancel));
        state.accounts.push(account.clone());
        account
    }

    /// Auth-callback path: provision the account, learn the username, then
    /// in one critical section replace any older duplicate and persist the
    /// token. A creation superseded mid-probe is discarded.
    pub async fn create_account(
        &self,
        kind: ProviderKind,
        token: AuthToken,
        cancel: &CancellationToken,
    ) -> Result<Arc<Account>> {
        let username_cell = Arc::new(RwLock::new(None));
        let account = {
            let mut state = self.state.lock().await;
            self.build_account(&mut state, kind, token, username_cell.clone())
        };

        let probe_cancel = link_tokens(&account.cancel, cancel);
        match account.provider.get_general_data(&probe_cancel).await {
            Ok(data) => {
                *username_cell.write().unwrap() = Some(data.username);
                let id = account.account_id();
                let mut state = self.state.lock().await;
                self.remove_matching(&mut state, |entry| {
                    entry.version < account.version && entry.account_id() == id
                })
                .await;
                if state
                    .accounts
                    .iter()
                    .any(|entry| entry.version == account.version)
                {
                    let current = account.auth.current_token().await;
                    self.token_store.save(kind, &id.username, &current).await?;
                    self.listener.on_create(&account);
                }
                Ok(account)
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                self.remove_matching(&mut state, |entry| entry.version == account.version)
                    .await;
                Err(err)
            }
        }
    }

    /// Startup path: installed as active without the username probe, the
    /// identity is trusted from the persisted entry.
    pub async fn restore_account(&self, stored: StoredToken) -> Arc<Account> {
        let username = Arc::new(RwLock::new(Some(stored.id)));
        let mut state = self.state.lock().await;
        let account = self.build_account(&mut state, stored.kind, stored.token, username);
        self.listener.on_create(&account);
        account
    }

    pub async fn load_persisted(&self) {
        for stored in self.token_store.load().await {
            self.restore_account(stored).await;
        }
    }

    /// `/remove/<account_id>`: drain, notify, drop the persisted token.
    pub async fn remove_account(&self, id: &AccountId) {
        let mut state = self.state.lock().await;
        self.remove_matching(&mut state, |entry| &entry.account_id() == id)
            .await;
    }

    /// Shutdown: drain every active account; persisted tokens are kept.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        for account in &state.accounts {
            if !account.cancel.is_cancelled() {
                account.cancel.cancel();
                self.listener.on_destroy(account);
            }
        }
        state.accounts.clear();
    }

    async fn remove_matching(&self, state: &mut State, predicate: impl Fn(&Account) -> bool) {
        let mut kept = Vec::with_capacity(state.accounts.len());
        for account in state.accounts.drain(..) {
            if predicate(&account) && !account.cancel.is_cancelled() {
                account.cancel.cancel();
                self.listener.on_destroy(&account);
                let id = account.account_id();
                if !id.username.is_empty()
                    && let Err(err) = self.token_store.remove(account.kind, &id.username).await
                {
                    warn!(account = %id, error = %err, "failed to drop persisted token");
                }
            } else {
                kept.push(account);
            }
        }
        state.accounts = kept;
    }
}
