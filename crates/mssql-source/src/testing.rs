//! In-memory doubles for the connection and sink seams.
//!
//! [`FakeDatabase`] answers queries with scripted rows chosen by a substring
//! of the SQL; [`MemorySink`] records everything a sync emits, in order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use select_query::GeneratedQuery;
use sync_core::Field;

use crate::connection::{ConnectionProvider, RowStream, SourceConnection, SourceRow};
use crate::sink::{OutputSink, SourceRecord, StateMessage};

type Responder = Arc<dyn Fn(&GeneratedQuery) -> Result<Vec<SourceRow>> + Send + Sync>;

#[derive(Default)]
struct FakeState {
    responders: Vec<(String, Responder)>,
    selects: Vec<GeneratedQuery>,
    statements: Vec<GeneratedQuery>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted database shared by every connection it hands out.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer queries whose SQL contains `pattern`. The most recent matching
    /// registration wins.
    pub fn on<F>(&self, pattern: &str, handler: F) -> &Self
    where
        F: Fn(&GeneratedQuery) -> Result<Vec<SourceRow>> + Send + Sync + 'static,
    {
        lock(&self.state)
            .responders
            .push((pattern.to_string(), Arc::new(handler)));
        self
    }

    /// Answer queries whose SQL contains `pattern` with fixed rows.
    pub fn rows(&self, pattern: &str, rows: Vec<SourceRow>) -> &Self {
        self.on(pattern, move |_| Ok(rows.clone()))
    }

    /// Fail queries whose SQL contains `pattern`.
    pub fn fail(&self, pattern: &str, message: &str) -> &Self {
        let message = message.to_string();
        self.on(pattern, move |_| Err(anyhow::anyhow!(message.clone())))
    }

    /// Every select issued so far.
    pub fn selects(&self) -> Vec<GeneratedQuery> {
        lock(&self.state).selects.clone()
    }

    /// Every statement executed so far.
    pub fn statements(&self) -> Vec<GeneratedQuery> {
        lock(&self.state).statements.clone()
    }

    pub fn connection(&self) -> FakeConnection {
        FakeConnection { db: self.clone() }
    }

    fn responder(&self, query: &GeneratedQuery) -> Option<Responder> {
        lock(&self.state)
            .responders
            .iter()
            .rev()
            .find(|(pattern, _)| query.sql.contains(pattern.as_str()))
            .map(|(_, responder)| responder.clone())
    }
}

#[async_trait]
impl ConnectionProvider for FakeDatabase {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        Ok(Box::new(self.connection()))
    }
}

/// Connection to a [`FakeDatabase`].
pub struct FakeConnection {
    db: FakeDatabase,
}

#[async_trait]
impl SourceConnection for FakeConnection {
    async fn select<'a>(
        &'a mut self,
        query: &'a GeneratedQuery,
        _fields: &'a [Field],
    ) -> Result<RowStream<'a>> {
        lock(&self.db.state).selects.push(query.clone());
        let responder = self
            .db
            .responder(query)
            .ok_or_else(|| anyhow::anyhow!("No scripted response for: {}", query.sql))?;
        let rows = responder(query)?;
        Ok(futures::stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn execute(&mut self, query: &GeneratedQuery) -> Result<u64> {
        lock(&self.db.state).statements.push(query.clone());
        match self.db.responder(query) {
            Some(responder) => Ok(responder(query)?.len() as u64),
            None => Ok(0),
        }
    }
}

/// Something a sync handed to its sink.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    Record(SourceRecord),
    State(StateMessage),
}

/// Sink that keeps everything in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        lock(&self.events).clone()
    }

    pub fn records(&self) -> Vec<SourceRecord> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::Record(record) => Some(record),
                SinkEvent::State(_) => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<StateMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SinkEvent::State(state) => Some(state),
                SinkEvent::Record(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn emit_record(&self, record: SourceRecord) -> Result<()> {
        lock(&self.events).push(SinkEvent::Record(record));
        Ok(())
    }

    async fn emit_state(&self, state: StateMessage) -> Result<()> {
        lock(&self.events).push(SinkEvent::State(state));
        Ok(())
    }
}
