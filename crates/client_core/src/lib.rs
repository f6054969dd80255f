//! Shopping-list controller: an observable projection of an [`ItemStore`].
//!
//! All projection state is owned by a single reconciliation task. The
//! presentation layer talks to it through a [`ListHandle`], which queues
//! [`Intent`]s and returns immediately. Store calls run on their own tasks and
//! report back to the same loop, so the projection is never mutated anywhere
//! else.

use std::{collections::HashMap, future::Future, mem, sync::Arc};

use anyhow::Result;
use shared::{
    domain::{bought_count, normalize_name, ItemId, NewItem, ShoppingItem},
    error::{ErrorCode, ListError},
    protocol::{Intent, ListEvent},
};
use storage::ItemStore;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Snapshot of the projection as seen by the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListState {
    pub items: Vec<ShoppingItem>,
    pub is_refreshing: bool,
    pub last_error: Option<ListError>,
}

impl ListState {
    pub fn bought_count(&self) -> usize {
        bought_count(&self.items)
    }

    pub fn position_of(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("index {index} is out of range for a projection of {len} items")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("list controller is no longer running")]
    Closed,
}

enum Command {
    Intent(Intent),
    Settle(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

enum Completion {
    Reloaded {
        generation: u64,
        result: Result<Vec<ShoppingItem>>,
    },
    ItemWritten {
        id: ItemId,
        changes: Vec<ItemChange>,
        result: Result<Option<ShoppingItem>>,
    },
    Written {
        intent: &'static str,
        item_id: Option<ItemId>,
        result: Result<()>,
    },
}

/// A field-level change to one stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ItemChange {
    ToggleBought,
    Rename(String),
}

impl ItemChange {
    fn apply(&self, item: ShoppingItem) -> ShoppingItem {
        match self {
            ItemChange::ToggleBought => item.toggled(),
            ItemChange::Rename(name) => item.renamed(name.as_str()),
        }
    }

    fn intent(&self, id: ItemId) -> Intent {
        match self {
            ItemChange::ToggleBought => Intent::ToggleBought { id },
            ItemChange::Rename(name) => Intent::EditItem {
                id,
                name: name.clone(),
            },
        }
    }
}

/// Applies `changes` on top of `base` (or the stored row when `base` is
/// unknown) and writes the result. `None` means the row does not exist.
async fn write_item_changes(
    store: &dyn ItemStore,
    id: ItemId,
    base: Option<ShoppingItem>,
    changes: &[ItemChange],
) -> Result<Option<ShoppingItem>> {
    let base = match base {
        Some(base) => Some(base),
        None => store.find(id).await?,
    };
    let Some(base) = base else {
        return Ok(None);
    };
    let item = changes
        .iter()
        .fold(base, |item, change| change.apply(item));
    let matched = store.update(&item).await?;
    Ok(matched.then_some(item))
}

/// Cloneable entry point for the presentation layer.
#[derive(Clone)]
pub struct ListHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ListState>,
    events: broadcast::Sender<ListEvent>,
}

impl ListHandle {
    pub fn refresh(&self) -> Result<(), ControllerError> {
        self.dispatch(Intent::Refresh)
    }

    /// Blank names are rejected by the controller without touching the store.
    pub fn add_item(&self, name: impl Into<String>) -> Result<(), ControllerError> {
        self.dispatch(Intent::AddItem { name: name.into() })
    }

    pub fn toggle_bought(&self, id: ItemId) -> Result<(), ControllerError> {
        self.dispatch(Intent::ToggleBought { id })
    }

    /// Resolves `index` against the current projection and toggles that item by id.
    pub fn toggle_bought_at(&self, index: usize) -> Result<(), ControllerError> {
        let id = {
            let state = self.state.borrow();
            state
                .items
                .get(index)
                .map(|item| item.id)
                .ok_or(ControllerError::IndexOutOfRange {
                    index,
                    len: state.items.len(),
                })?
        };
        self.toggle_bought(id)
    }

    pub fn delete_item(&self, id: ItemId) -> Result<(), ControllerError> {
        self.dispatch(Intent::DeleteItem { id })
    }

    pub fn edit_item(&self, id: ItemId, name: impl Into<String>) -> Result<(), ControllerError> {
        self.dispatch(Intent::EditItem {
            id,
            name: name.into(),
        })
    }

    pub fn dispatch(&self, intent: Intent) -> Result<(), ControllerError> {
        let name = intent.name();
        self.commands
            .send(Command::Intent(intent))
            .map_err(|_| ControllerError::Closed)?;
        debug!(command = name, "queued list intent");
        Ok(())
    }

    pub fn snapshot(&self) -> ListState {
        self.state.borrow().clone()
    }

    pub fn items(&self) -> Vec<ShoppingItem> {
        self.state.borrow().items.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.borrow().is_refreshing
    }

    pub fn last_error(&self) -> Option<ListError> {
        self.state.borrow().last_error.clone()
    }

    pub fn bought_count(&self) -> usize {
        self.state.borrow().bought_count()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListState> {
        self.state.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ListEvent> {
        self.events.subscribe()
    }

    /// Waits until every intent queued so far, and every store call it
    /// triggered, has been applied to the projection.
    pub async fn settle(&self) -> Result<(), ControllerError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Settle(reply))
            .map_err(|_| ControllerError::Closed)?;
        done.await.map_err(|_| ControllerError::Closed)
    }

    /// Lets in-flight store calls finish, then stops the controller.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(reply))
            .map_err(|_| ControllerError::Closed)?;
        done.await.map_err(|_| ControllerError::Closed)
    }
}

pub struct ListController {
    store: Arc<dyn ItemStore>,
    state: ListState,
    state_tx: watch::Sender<ListState>,
    events: broadcast::Sender<ListEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    next_generation: u64,
    applied_generation: u64,
    refreshes_in_flight: usize,
    in_flight: usize,
    // One row write in flight per id; later changes wait here and are folded
    // onto the value the in-flight write produces.
    pending_changes: HashMap<ItemId, Vec<ItemChange>>,
    settle_waiters: Vec<oneshot::Sender<()>>,
}

impl ListController {
    /// Starts the reconciliation task on the current tokio runtime and issues
    /// the initial load.
    pub fn spawn(store: Arc<dyn ItemStore>) -> ListHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ListState::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut controller = Self {
            store,
            state: ListState::default(),
            state_tx,
            events: events.clone(),
            completions: completions_tx,
            next_generation: 0,
            applied_generation: 0,
            refreshes_in_flight: 0,
            in_flight: 0,
            pending_changes: HashMap::new(),
            settle_waiters: Vec::new(),
        };
        controller.start_refresh();
        tokio::spawn(controller.run(commands_rx, completions_rx));

        ListHandle {
            commands: commands_tx,
            state: state_rx,
            events,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                Some(completion) = completions.recv() => self.on_completion(completion),
                command = commands.recv() => match command {
                    Some(Command::Intent(intent)) => self.on_intent(intent),
                    Some(Command::Settle(reply)) => {
                        self.settle_waiters.push(reply);
                        self.notify_if_settled();
                    }
                    Some(Command::Shutdown(reply)) => {
                        commands.close();
                        while self.in_flight > 0 {
                            match completions.recv().await {
                                Some(completion) => self.on_completion(completion),
                                None => break,
                            }
                        }
                        info!(items = self.state.items.len(), "list controller stopped");
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        debug!("all list handles dropped; stopping controller");
                        return;
                    }
                },
            }
        }
    }

    fn on_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Refresh => self.start_refresh(),
            Intent::AddItem { ref name } => {
                let Some(name) = normalize_name(name) else {
                    self.reject(intent, ListError::validation("item name must not be blank"));
                    return;
                };
                let store = Arc::clone(&self.store);
                self.spawn_store_call(async move {
                    let result = store.insert(NewItem::new(name)).await;
                    Completion::Written {
                        intent: "add_item",
                        item_id: result.as_ref().ok().map(|item| item.id),
                        result: result.map(|_| ()),
                    }
                });
            }
            Intent::ToggleBought { id } => self.queue_change(id, ItemChange::ToggleBought),
            Intent::DeleteItem { id } => {
                let store = Arc::clone(&self.store);
                self.spawn_store_call(async move {
                    Completion::Written {
                        intent: "delete_item",
                        item_id: Some(id),
                        result: store.delete(id).await.map(|_| ()),
                    }
                });
            }
            Intent::EditItem { id, ref name } => {
                let Some(name) = normalize_name(name) else {
                    self.reject(intent, ListError::validation("item name must not be blank"));
                    return;
                };
                self.queue_change(id, ItemChange::Rename(name));
            }
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Reloaded { generation, result } => {
                self.refreshes_in_flight = self.refreshes_in_flight.saturating_sub(1);
                match result {
                    Ok(items) if generation > self.applied_generation => {
                        self.applied_generation = generation;
                        self.state.items = items;
                        self.state.last_error = None;
                        debug!(
                            generation,
                            items = self.state.items.len(),
                            "applied list reload"
                        );
                        self.emit(ListEvent::ProjectionChanged {
                            items: self.state.items.clone(),
                        });
                    }
                    Ok(_) => {
                        debug!(
                            generation,
                            applied_generation = self.applied_generation,
                            "discarding stale list reload"
                        );
                    }
                    Err(err) => self.record_storage_failure("refresh", None, &err),
                }
                if self.refreshes_in_flight == 0 {
                    self.state.is_refreshing = false;
                }
                self.emit(ListEvent::RefreshFinished { generation });
                self.publish();
            }
            Completion::ItemWritten {
                id,
                changes,
                result,
            } => self.on_item_written(id, changes, result),
            Completion::Written {
                intent,
                item_id,
                result,
            } => match result {
                Ok(()) => {
                    info!(
                        command = intent,
                        item_id = item_id.map(|id| id.0),
                        "list write applied"
                    );
                    self.start_refresh();
                }
                Err(err) => self.record_storage_failure(intent, item_id, &err),
            },
        }

        self.in_flight = self.in_flight.saturating_sub(1);
        self.notify_if_settled();
    }

    fn on_item_written(
        &mut self,
        id: ItemId,
        changes: Vec<ItemChange>,
        result: Result<Option<ShoppingItem>>,
    ) {
        let next_base = match result {
            Ok(Some(item)) => {
                info!(
                    item_id = id.0,
                    changes = changes.len(),
                    is_bought = item.is_bought,
                    "item write applied"
                );
                if let Some(position) = self.state.position_of(id) {
                    self.state.items[position] = item.clone();
                    self.emit(ListEvent::ProjectionChanged {
                        items: self.state.items.clone(),
                    });
                    self.publish();
                }
                let renamed = changes
                    .iter()
                    .any(|change| matches!(change, ItemChange::Rename(_)));
                // A reload still in flight may have read the row before this write.
                if renamed || self.refreshes_in_flight > 0 {
                    self.start_refresh();
                }
                Some(item)
            }
            Ok(None) => {
                debug!(item_id = id.0, "item write target no longer stored");
                for change in &changes {
                    self.reject(
                        change.intent(id),
                        ListError::new(ErrorCode::NotFound, format!("item {id} is not stored")),
                    );
                }
                None
            }
            Err(err) => {
                self.record_storage_failure("write_item", Some(id), &err);
                None
            }
        };

        let queued = self
            .pending_changes
            .get_mut(&id)
            .map(mem::take)
            .unwrap_or_default();
        if queued.is_empty() {
            self.pending_changes.remove(&id);
        } else {
            self.spawn_item_write(id, next_base, queued);
        }
    }

    /// Queues `change` behind any write already in flight for `id`.
    fn queue_change(&mut self, id: ItemId, change: ItemChange) {
        if let Some(queued) = self.pending_changes.get_mut(&id) {
            debug!(item_id = id.0, "item write in flight; queueing change");
            queued.push(change);
            return;
        }
        self.pending_changes.insert(id, Vec::new());
        let base = self
            .state
            .position_of(id)
            .map(|position| self.state.items[position].clone());
        self.spawn_item_write(id, base, vec![change]);
    }

    fn spawn_item_write(
        &mut self,
        id: ItemId,
        base: Option<ShoppingItem>,
        changes: Vec<ItemChange>,
    ) {
        let store = Arc::clone(&self.store);
        self.spawn_store_call(async move {
            let result = write_item_changes(store.as_ref(), id, base, &changes).await;
            Completion::ItemWritten {
                id,
                changes,
                result,
            }
        });
    }

    fn start_refresh(&mut self) {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.refreshes_in_flight += 1;
        if !self.state.is_refreshing {
            self.state.is_refreshing = true;
            self.publish();
        }
        self.emit(ListEvent::RefreshStarted { generation });

        let store = Arc::clone(&self.store);
        self.spawn_store_call(async move {
            Completion::Reloaded {
                generation,
                result: store.list_all().await,
            }
        });
    }

    fn spawn_store_call<F>(&mut self, call: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        self.in_flight += 1;
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let _ = completions.send(call.await);
        });
    }

    fn reject(&mut self, intent: Intent, error: ListError) {
        warn!(command = intent.name(), reason = %error.message, "rejected list intent");
        self.emit(ListEvent::Rejected { intent, error });
    }

    fn record_storage_failure(
        &mut self,
        operation: &'static str,
        item_id: Option<ItemId>,
        err: &anyhow::Error,
    ) {
        error!(
            command = operation,
            item_id = item_id.map(|id| id.0),
            error = %format!("{err:#}"),
            "shopping item store call failed"
        );
        let list_error = ListError::storage_unavailable(format!("{operation} failed: {err:#}"));
        self.state.last_error = Some(list_error.clone());
        self.emit(ListEvent::Error(list_error));
        self.publish();
    }

    fn notify_if_settled(&mut self) {
        if self.in_flight > 0 {
            return;
        }
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn emit(&self, event: ListEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
