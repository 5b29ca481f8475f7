//! In-memory remote database.
//!
//! [`MemoryRemote`] keeps a JSON tree and a task queue. Registrations and
//! mutations only enqueue notifications; nothing reaches a callback until
//! [`MemoryRemote::flush`] runs the queue, so callbacks never re-enter the
//! caller.

use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};

use livebind_core::{path, Query, QueryState, Record, Value, WriteMethod};
use parking_lot::Mutex;
use serde_json::{json, Map};
use tracing::trace;

use super::{
    AuthCallback, ConnectivityCallback, DataSnapshot, Delivery, EventKind, ListenerCallback,
    ListenerHandle, ReadCallback, RemoteClient, WriteCallback,
};
use crate::auth::{AuthProvider, AuthReply, OAuthFlow};
use crate::error::{RemoteError, RemoteResult};

/// Prefix of keys generated by `push`.
pub const PUSH_KEY_PREFIX: &str = "-K";

struct Listener {
    query: Query,
    kind: EventKind,
    callback: ListenerCallback,
}

struct Account {
    uid: String,
    password: String,
}

enum Task {
    Deliver {
        handle: ListenerHandle,
        result: RemoteResult<Delivery>,
    },
    Connectivity {
        handle: ListenerHandle,
        connected: bool,
    },
    Auth {
        handle: ListenerHandle,
        user: Option<Value>,
    },
    Read {
        query: Query,
        reply: ReadCallback,
    },
    Reply(Box<dyn FnOnce() + Send>),
}

struct Inner {
    root: Value,
    listeners: BTreeMap<ListenerHandle, Listener>,
    connectivity: BTreeMap<ListenerHandle, ConnectivityCallback>,
    auth: BTreeMap<ListenerHandle, AuthCallback>,
    tasks: VecDeque<Task>,
    next_handle: u64,
    next_push: u64,
    connected: bool,
    user: Option<Value>,
    denied: Vec<String>,
    accounts: BTreeMap<String, Account>,
    observe_calls: usize,
}

/// A remote database held in memory.
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Creates an empty, disconnected remote.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: Value::Null,
                listeners: BTreeMap::new(),
                connectivity: BTreeMap::new(),
                auth: BTreeMap::new(),
                tasks: VecDeque::new(),
                next_handle: 1,
                next_push: 0,
                connected: false,
                user: None,
                denied: Vec::new(),
                accounts: BTreeMap::new(),
                observe_calls: 0,
            }),
        }
    }

    /// Creates a connected remote holding `data`.
    pub fn online(data: Value) -> Self {
        let remote = Self::new();
        {
            let mut inner = remote.inner.lock();
            inner.root = normalize_value(data);
            inner.connected = true;
        }
        remote
    }

    /// Runs queued notifications until the queue is empty.
    ///
    /// Returns the number of tasks run.
    pub fn flush(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    /// Runs the oldest queued notification, if any.
    pub fn run_next(&self) -> bool {
        let task = self.inner.lock().tasks.pop_front();
        match task {
            Some(task) => {
                self.run(task);
                true
            }
            None => false,
        }
    }

    fn run(&self, task: Task) {
        match task {
            Task::Deliver { handle, result } => {
                let callback = {
                    let mut inner = self.inner.lock();
                    let callback = match inner.listeners.get(&handle) {
                        Some(listener) => listener.callback.clone(),
                        None => return,
                    };
                    if result.is_err() {
                        inner.listeners.remove(&handle);
                    }
                    callback
                };
                callback(result);
            }
            Task::Connectivity { handle, connected } => {
                let callback = self.inner.lock().connectivity.get(&handle).cloned();
                if let Some(callback) = callback {
                    callback(connected);
                }
            }
            Task::Auth { handle, user } => {
                let callback = self.inner.lock().auth.get(&handle).cloned();
                if let Some(callback) = callback {
                    callback(user);
                }
            }
            Task::Read { query, reply } => {
                let result = {
                    let inner = self.inner.lock();
                    inner.check_access(&query.path).map(|()| inner.snapshot(&query))
                };
                reply(result);
            }
            Task::Reply(reply) => reply(),
        }
    }

    /// Returns the value stored at `path`.
    pub fn get(&self, path: &str) -> Value {
        get_at(&self.inner.lock().root, &path::normalize(path)).clone()
    }

    /// Replaces the value at `path`; `null` removes it.
    pub fn set(&self, path: &str, value: Value) {
        self.inner.lock().mutate(|root| set_at(root, &path::normalize(path), value));
    }

    /// Appends `value` under a generated key and returns the key.
    pub fn push(&self, path: &str, value: Value) -> String {
        let mut inner = self.inner.lock();
        let key = inner.push_key();
        let child = path::join(path, &key);
        inner.mutate(|root| set_at(root, &child, value));
        key
    }

    /// Merges the children of `value` into the node at `path`.
    pub fn update(&self, path: &str, value: Value) {
        self.inner.lock().mutate(|root| update_at(root, path, value));
    }

    /// Removes the value at `path`.
    pub fn remove(&self, path: &str) {
        self.set(path, Value::Null);
    }

    /// Rejects every access at or below `prefix`.
    pub fn deny(&self, prefix: &str) {
        self.inner.lock().denied.push(path::normalize(prefix));
    }

    /// Reports a connectivity change to every connectivity listener.
    pub fn set_connected(&self, connected: bool) {
        let mut inner = self.inner.lock();
        inner.connected = connected;
        let handles: Vec<ListenerHandle> = inner.connectivity.keys().copied().collect();
        for handle in handles {
            inner.tasks.push_back(Task::Connectivity { handle, connected });
        }
    }

    /// Reports a sign-in (`Some`) or sign-out (`None`) to every auth listener.
    pub fn set_auth(&self, user: Option<Value>) {
        self.inner.lock().set_user(user);
    }

    /// Registers an account for the auth flows.
    pub fn add_user(&self, email: &str, password: &str) -> String {
        let mut inner = self.inner.lock();
        inner.add_account(email, password)
    }

    /// Number of `observe` calls made so far.
    pub fn observe_count(&self) -> usize {
        self.inner.lock().observe_calls
    }

    /// Number of data listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Number of queued notifications.
    pub fn pending_tasks(&self) -> usize {
        self.inner.lock().tasks.len()
    }
}

impl Inner {
    fn handle(&mut self) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn push_key(&mut self) -> String {
        let key = format!("{PUSH_KEY_PREFIX}{:012}", self.next_push);
        self.next_push += 1;
        key
    }

    fn check_access(&self, target: &str) -> RemoteResult<()> {
        if self.denied.iter().any(|prefix| path::is_within(target, prefix)) {
            return Err(RemoteError::permission_denied(target));
        }
        Ok(())
    }

    fn snapshot(&self, query: &Query) -> DataSnapshot {
        view(&self.root, query)
    }

    fn reply(&mut self, reply: impl FnOnce() + Send + 'static) {
        self.tasks.push_back(Task::Reply(Box::new(reply)));
    }

    fn set_user(&mut self, user: Option<Value>) {
        self.user = user.clone();
        let handles: Vec<ListenerHandle> = self.auth.keys().copied().collect();
        for handle in handles {
            self.tasks.push_back(Task::Auth {
                handle,
                user: user.clone(),
            });
        }
    }

    fn add_account(&mut self, email: &str, password: &str) -> String {
        let uid = format!("user{}", self.accounts.len() + 1);
        self.accounts.insert(
            email.to_string(),
            Account {
                uid: uid.clone(),
                password: password.to_string(),
            },
        );
        uid
    }

    /// Applies `f` to the tree and queues the resulting notifications.
    fn mutate(&mut self, f: impl FnOnce(&mut Value)) {
        let before: Vec<(ListenerHandle, DataSnapshot)> = self
            .listeners
            .iter()
            .map(|(handle, listener)| (*handle, view(&self.root, &listener.query)))
            .collect();

        f(&mut self.root);

        let mut queued: Vec<(u8, usize, ListenerHandle, Delivery)> = Vec::new();
        for (handle, old) in before {
            let Some(listener) = self.listeners.get(&handle) else {
                continue;
            };
            let new = view(&self.root, &listener.query);
            for (phase, index, delivery) in diff(listener.kind, &old, &new) {
                queued.push((phase, index, handle, delivery));
            }
        }
        // Removals first, then placements in final order, then changes.
        queued.sort_by_key(|(phase, index, handle, _)| (*phase, *index, *handle));
        for (_, _, handle, delivery) in queued {
            trace!(?handle, key = %delivery.snapshot.key, "queueing delivery");
            self.tasks.push_back(Task::Deliver {
                handle,
                result: Ok(delivery),
            });
        }
    }
}

impl RemoteClient for MemoryRemote {
    fn observe(&self, query: &Query, kind: EventKind, callback: ListenerCallback) -> ListenerHandle {
        let mut inner = self.inner.lock();
        inner.observe_calls += 1;
        let handle = inner.handle();
        inner.listeners.insert(
            handle,
            Listener {
                query: query.clone(),
                kind,
                callback,
            },
        );

        if let Err(err) = inner.check_access(&query.path) {
            inner.tasks.push_back(Task::Deliver {
                handle,
                result: Err(err),
            });
            return handle;
        }

        let current = inner.snapshot(query);
        let initial = match kind {
            EventKind::Value => vec![Delivery {
                snapshot: current,
                previous_key: None,
            }],
            EventKind::ChildAdded => added_in_order(&current.children),
            _ => Vec::new(),
        };
        for delivery in initial {
            inner.tasks.push_back(Task::Deliver {
                handle,
                result: Ok(delivery),
            });
        }
        handle
    }

    fn stop_observing(&self, handle: ListenerHandle) {
        let mut inner = self.inner.lock();
        inner.listeners.remove(&handle);
        inner.connectivity.remove(&handle);
        inner.auth.remove(&handle);
    }

    fn read_once(&self, query: &Query, reply: ReadCallback) {
        self.inner.lock().tasks.push_back(Task::Read {
            query: query.clone(),
            reply,
        });
    }

    fn write(&self, target: &str, method: WriteMethod, value: Value, reply: WriteCallback) {
        let mut inner = self.inner.lock();
        let target = path::normalize(target);
        if let Err(err) = inner.check_access(&target) {
            inner.reply(move || reply(Err(err)));
            return;
        }
        match method {
            WriteMethod::Set | WriteMethod::Transaction => {
                inner.mutate(|root| set_at(root, &target, value));
            }
            WriteMethod::Push => {
                let child = path::join(&target, &inner.push_key());
                inner.mutate(|root| set_at(root, &child, value));
            }
            WriteMethod::Update => {
                if !value.is_object() {
                    inner.reply(move || reply(Err(RemoteError::failed("update expects an object"))));
                    return;
                }
                inner.mutate(|root| update_at(root, &target, value));
            }
        }
        inner.reply(move || reply(Ok(())));
    }

    fn observe_connectivity(&self, callback: ConnectivityCallback) -> ListenerHandle {
        let mut inner = self.inner.lock();
        let handle = inner.handle();
        inner.connectivity.insert(handle, callback);
        let connected = inner.connected;
        inner.tasks.push_back(Task::Connectivity { handle, connected });
        handle
    }

    fn observe_auth(&self, callback: AuthCallback) -> ListenerHandle {
        let mut inner = self.inner.lock();
        let handle = inner.handle();
        inner.auth.insert(handle, callback);
        let user = inner.user.clone();
        inner.tasks.push_back(Task::Auth { handle, user });
        handle
    }
}

impl AuthProvider for MemoryRemote {
    fn sign_in_with_password(&self, email: &str, password: &str, reply: AuthReply) {
        let mut inner = self.inner.lock();
        let result = match inner.accounts.get(email) {
            None => Err(RemoteError::coded(
                "INVALID_USER",
                "The specified user does not exist.",
            )),
            Some(account) if account.password != password => Err(RemoteError::coded(
                "INVALID_PASSWORD",
                "The specified password is incorrect.",
            )),
            Some(account) => Ok(json!({"uid": account.uid, "email": email, "provider": "password"})),
        };
        if let Ok(user) = &result {
            inner.set_user(Some(user.clone()));
        }
        inner.reply(move || reply(result));
    }

    fn sign_in_with_oauth(&self, flow: OAuthFlow, provider: &str, reply: AuthReply) {
        let mut inner = self.inner.lock();
        let user = json!({"uid": format!("{provider}:user"), "provider": provider, "flow": flow.as_str()});
        inner.set_user(Some(user.clone()));
        inner.reply(move || reply(Ok(user)));
    }

    fn create_user(&self, email: &str, password: &str, reply: AuthReply) {
        let mut inner = self.inner.lock();
        let result = if !email.contains('@') {
            Err(RemoteError::coded(
                "INVALID_EMAIL",
                "The specified email address is invalid.",
            ))
        } else if inner.accounts.contains_key(email) {
            Err(RemoteError::coded(
                "EMAIL_TAKEN",
                "The specified email address is already in use.",
            ))
        } else {
            let uid = inner.add_account(email, password);
            Ok(json!({"uid": uid}))
        };
        inner.reply(move || reply(result));
    }

    fn reset_password(&self, email: &str, reply: AuthReply) {
        let mut inner = self.inner.lock();
        let result = if inner.accounts.contains_key(email) {
            Ok(Value::Null)
        } else {
            Err(RemoteError::coded(
                "INVALID_USER",
                "The specified user does not exist.",
            ))
        };
        inner.reply(move || reply(result));
    }

    fn sign_out(&self) {
        self.inner.lock().set_user(None);
    }
}

/// Child-added deliveries for `children` in order.
fn added_in_order(children: &[Record]) -> Vec<Delivery> {
    let mut previous: Option<String> = None;
    children
        .iter()
        .map(|record| {
            let delivery = Delivery {
                snapshot: child_snapshot(record),
                previous_key: previous.clone(),
            };
            previous = Some(record.key.clone());
            delivery
        })
        .collect()
}

fn child_snapshot(record: &Record) -> DataSnapshot {
    DataSnapshot::new(
        record.key.clone(),
        record.value.clone(),
        livebind_core::record::from_value(&record.value),
    )
}

/// Notifications a listener of `kind` receives when its view goes from
/// `old` to `new`, tagged with `(phase, index)` for cross-listener ordering.
///
/// Applying the removals, then the added and moved children in final order,
/// then the changes, to `old` yields `new`. Children on a longest increasing
/// run of old positions stay put; every other surviving child is moved.
fn diff(kind: EventKind, old: &DataSnapshot, new: &DataSnapshot) -> Vec<(u8, usize, Delivery)> {
    let delivery = |record: &Record, previous_key: Option<String>| Delivery {
        snapshot: child_snapshot(record),
        previous_key,
    };

    match kind {
        EventKind::Value => {
            if old.value == new.value {
                return Vec::new();
            }
            let snapshot = Delivery {
                snapshot: new.clone(),
                previous_key: None,
            };
            vec![(3, 0, snapshot)]
        }
        EventKind::ChildRemoved => {
            let remaining: BTreeMap<&str, ()> =
                new.children.iter().map(|r| (r.key.as_str(), ())).collect();
            old.children
                .iter()
                .enumerate()
                .filter(|(_, record)| !remaining.contains_key(record.key.as_str()))
                .map(|(i, record)| (0, i, delivery(record, None)))
                .collect()
        }
        EventKind::ChildAdded | EventKind::ChildMoved => {
            let old_pos: BTreeMap<&str, usize> = old
                .children
                .iter()
                .enumerate()
                .map(|(i, record)| (record.key.as_str(), i))
                .collect();
            let surviving: Vec<usize> = new
                .children
                .iter()
                .filter_map(|record| old_pos.get(record.key.as_str()).copied())
                .collect();
            let mut stays = longest_increasing(&surviving).into_iter();

            let mut out = Vec::new();
            for (i, record) in new.children.iter().enumerate() {
                let emit = match old_pos.get(record.key.as_str()) {
                    None => kind == EventKind::ChildAdded,
                    Some(_) => {
                        let stays = stays.next().unwrap_or(true);
                        kind == EventKind::ChildMoved && !stays
                    }
                };
                if emit {
                    let previous = i.checked_sub(1).map(|p| new.children[p].key.clone());
                    out.push((1, i, delivery(record, previous)));
                }
            }
            out
        }
        EventKind::ChildChanged => {
            let before: BTreeMap<&str, &Value> = old
                .children
                .iter()
                .map(|record| (record.key.as_str(), &record.value))
                .collect();
            new.children
                .iter()
                .enumerate()
                .filter(|(_, record)| {
                    before
                        .get(record.key.as_str())
                        .is_some_and(|value| **value != record.value)
                })
                .map(|(i, record)| (2, i, delivery(record, None)))
                .collect()
        }
    }
}

/// Marks the members of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<bool> {
    let n = seq.len();
    let mut length = vec![1usize; n];
    let mut link: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        for j in 0..i {
            if seq[j] < seq[i] && length[j] + 1 > length[i] {
                length[i] = length[j] + 1;
                link[i] = Some(j);
            }
        }
    }
    let mut keep = vec![false; n];
    let mut at = (0..n).max_by_key(|&i| length[i]);
    while let Some(i) = at {
        keep[i] = true;
        at = link[i];
    }
    keep
}

/// The snapshot `query` sees in `root`.
fn view(root: &Value, query: &Query) -> DataSnapshot {
    let node = get_at(root, &query.path);
    let key = query.key().to_string();
    let Value::Object(map) = node else {
        return DataSnapshot::new(key, node.clone(), Vec::new());
    };

    let mut children: Vec<Record> = map
        .iter()
        .map(|(key, value)| Record::new(key.clone(), value.clone()))
        .collect();

    if query.state.is_empty() {
        children.sort_by(|a, b| key_cmp(&a.key, &b.key));
        return DataSnapshot::new(key, node.clone(), children);
    }

    let state = &query.state;
    children.sort_by(|a, b| order_cmp(state, a, b));
    children.retain(|record| in_range(state, record));
    if let Some(n) = state.limit_to_first {
        children.truncate(n as usize);
    }
    if let Some(n) = state.limit_to_last {
        let skip = children.len().saturating_sub(n as usize);
        children = children.split_off(skip);
    }

    let value = if children.is_empty() {
        Value::Null
    } else {
        Value::Object(
            children
                .iter()
                .map(|record| (record.key.clone(), record.value.clone()))
                .collect::<Map<String, Value>>(),
        )
    };
    DataSnapshot::new(key, value, children)
}

/// Value a record is ordered and filtered by; `None` means by key.
fn order_value<'a>(state: &QueryState, record: &'a Record) -> Option<&'a Value> {
    if let Some(child) = &state.order_by_child {
        return Some(get_at(&record.value, child));
    }
    if state.order_by_value {
        return Some(&record.value);
    }
    None
}

fn order_cmp(state: &QueryState, a: &Record, b: &Record) -> Ordering {
    match (order_value(state, a), order_value(state, b)) {
        (Some(x), Some(y)) => value_cmp(x, y).then_with(|| key_cmp(&a.key, &b.key)),
        _ => key_cmp(&a.key, &b.key),
    }
}

fn bound_cmp(state: &QueryState, record: &Record, bound: &Value) -> Ordering {
    match order_value(state, record) {
        Some(value) => value_cmp(value, bound),
        None => {
            let bound = match bound {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            key_cmp(&record.key, &bound)
        }
    }
}

fn in_range(state: &QueryState, record: &Record) -> bool {
    if let Some(bound) = &state.equal_to {
        if bound_cmp(state, record, bound) != Ordering::Equal {
            return false;
        }
    }
    if let Some(bound) = &state.start_at {
        if bound_cmp(state, record, bound) == Ordering::Less {
            return false;
        }
    }
    if let Some(bound) = &state.end_at {
        if bound_cmp(state, record, bound) == Ordering::Greater {
            return false;
        }
    }
    true
}

/// Integer-like keys first, numerically, then the rest lexicographically.
fn key_cmp(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) | Value::Object(_) => 5,
    }
}

/// null < false < true < numbers < strings < objects.
fn value_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Converts arrays into index-keyed objects and drops nulls and empty nodes.
fn normalize_value(value: Value) -> Value {
    let map: Map<String, Value> = match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| (key, normalize_value(value)))
            .filter(|(_, value)| !value.is_null())
            .collect(),
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, value)| (index.to_string(), normalize_value(value)))
            .filter(|(_, value)| !value.is_null())
            .collect(),
        other => return other,
    };
    if map.is_empty() {
        Value::Null
    } else {
        Value::Object(map)
    }
}

fn get_at<'a>(root: &'a Value, target: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    let mut node = root;
    for segment in path::segments(target) {
        match node.get(segment) {
            Some(child) => node = child,
            None => return &NULL,
        }
    }
    node
}

fn set_at(root: &mut Value, target: &str, value: Value) {
    let segments: Vec<&str> = path::segments(target).collect();
    set_segments(root, &segments, normalize_value(value));
}

fn set_segments(node: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        if value.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(head.to_string()).or_insert(Value::Null);
        set_segments(child, rest, value);
        if child.is_null() {
            map.remove(*head);
        }
        if map.is_empty() {
            *node = Value::Null;
        }
    }
}

fn update_at(root: &mut Value, target: &str, value: Value) {
    if let Value::Object(children) = value {
        for (child, value) in children {
            set_at(root, &path::join(target, &child), value);
        }
    }
}
