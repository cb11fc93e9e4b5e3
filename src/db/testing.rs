//! In-crate recording driver for tests.
//!
//! Records every statement executed through its connections and every pool it
//! opens or closes, so bootstrap and rebuild counts can be asserted without a
//! real database.

use crate::db::driver::{
    ConnectHook, Connection, Driver, Interrupter, Pool, PoolOptions, RawColumn, RawFrame,
    RawValue,
};
use crate::error::{DbError, DbResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Log {
    executed: Mutex<Vec<String>>,
    queried: Mutex<Vec<String>>,
    opened: Mutex<Vec<String>>,
    closed: AtomicUsize,
    interrupted: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDriver {
    fail_on: Option<String>,
    fail_open: bool,
    delay: Option<Duration>,
    open_delay: Option<Duration>,
    log: Arc<Log>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement or query containing `pattern`.
    pub fn fail_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Sleep this long in every query, or until the query is interrupted.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep this long whenever a pool is opened.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.log.executed.lock().unwrap().clone()
    }

    pub fn queried(&self) -> Vec<String> {
        self.log.queried.lock().unwrap().clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.executed().iter().filter(|s| s.contains(pattern)).count()
    }

    pub fn opened_targets(&self) -> Vec<String> {
        self.log.opened.lock().unwrap().clone()
    }

    pub fn closed_pools(&self) -> usize {
        self.log.closed.load(Ordering::SeqCst)
    }

    /// Queries that stopped early because they were interrupted.
    pub fn interrupted_queries(&self) -> usize {
        self.log.interrupted.load(Ordering::SeqCst)
    }
}

impl Driver for RecordingDriver {
    fn open_pool(
        &self,
        target: &str,
        _options: &PoolOptions,
        hook: ConnectHook,
    ) -> DbResult<Arc<dyn Pool>> {
        if let Some(delay) = self.open_delay {
            std::thread::sleep(delay);
        }
        if self.fail_open {
            return Err(DbError::connection("open refused", "none"));
        }
        self.log.opened.lock().unwrap().push(target.to_string());
        Ok(Arc::new(RecordingPool {
            driver: self.clone(),
            hook,
            closed: AtomicUsize::new(0),
        }))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct RecordingPool {
    driver: RecordingDriver,
    hook: ConnectHook,
    closed: AtomicUsize,
}

impl Pool for RecordingPool {
    fn get(&self) -> DbResult<Box<dyn Connection>> {
        if self.closed.load(Ordering::SeqCst) > 0 {
            return Err(DbError::connection("pool closed", "none"));
        }
        let conn = RecordingConnection {
            driver: self.driver.clone(),
            interrupted: Arc::new(AtomicBool::new(false)),
        };
        (self.hook)(&conn)?;
        Ok(Box::new(conn))
    }

    fn close(&self) {
        if self.closed.fetch_add(1, Ordering::SeqCst) == 0 {
            self.driver.log.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct RecordingConnection {
    driver: RecordingDriver,
    interrupted: Arc<AtomicBool>,
}

impl RecordingConnection {
    fn check(&self, sql: &str) -> DbResult<()> {
        match &self.driver.fail_on {
            Some(pattern) if sql.contains(pattern.as_str()) => Err(DbError::database(
                format!("Parser Error: syntax error at or near \"{}\"", pattern),
                "Check the SQL syntax",
            )),
            _ => Ok(()),
        }
    }
}

impl Connection for RecordingConnection {
    fn execute(&self, sql: &str) -> DbResult<()> {
        self.check(sql)?;
        self.driver.log.executed.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    fn query(&self, sql: &str) -> DbResult<RawFrame> {
        if let Some(delay) = self.driver.delay {
            let deadline = Instant::now() + delay;
            while Instant::now() < deadline {
                if self.interrupted.load(Ordering::SeqCst) {
                    self.driver.log.interrupted.fetch_add(1, Ordering::SeqCst);
                    return Err(DbError::database("INTERRUPT Error: Interrupted!", "none"));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        self.check(sql)?;
        self.driver.log.queried.lock().unwrap().push(sql.to_string());
        Ok(RawFrame {
            columns: vec![RawColumn::new("value", "INTEGER")],
            rows: vec![vec![RawValue::Int(1)]],
        })
    }

    fn interrupter(&self) -> Interrupter {
        let flag = self.interrupted.clone();
        Arc::new(move || flag.store(true, Ordering::SeqCst))
    }
}
