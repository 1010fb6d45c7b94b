use super::DbPool;
use crate::errors::StorageError;
use diesel::connection::Connection;
use diesel::SqliteConnection;
use log::{debug, error};
use quotevault_core::errors::Result;
use std::any::Any;
use tokio::sync::{mpsc, oneshot};

// A write job runs against the actor's connection inside one immediate
// transaction and reports a core Result.
type Job<T> = Box<dyn FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static>;

type Reply = oneshot::Sender<Result<Box<dyn Any + Send + 'static>>>;

/// Capacity of the job queue. Senders wait once it is full.
const QUEUE_DEPTH: usize = 1024;

/// Handle for sending jobs to the writer actor.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<(Job<Box<dyn Any + Send + 'static>>, Reply)>,
}

impl WriteHandle {
    /// Executes `job` on the writer's dedicated connection.
    ///
    /// Jobs run one at a time in submission order. A job that returns an
    /// error rolls its transaction back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static + Any,
    {
        let (ret_tx, ret_rx) = oneshot::channel();

        self.tx
            .send((
                Box::new(move |c| job(c).map(|v| Box::new(v) as Box<dyn Any + Send>)),
                ret_tx,
            ))
            .await
            .map_err(|_| StorageError::WriterUnavailable("writer stopped".into()))?;

        let boxed = ret_rx
            .await
            .map_err(|_| StorageError::WriterUnavailable("writer dropped the reply".into()))??;

        boxed.downcast::<T>().map(|v| *v).map_err(|_| {
            StorageError::WriterUnavailable("unexpected result type from writer".into()).into()
        })
    }
}

/// Spawns the single writer task.
///
/// The writer takes one connection from `pool` up front and holds it for its
/// lifetime; it stops once every [`WriteHandle`] is dropped.
pub fn spawn_writer(pool: &DbPool) -> std::result::Result<WriteHandle, StorageError> {
    let mut conn = pool.get()?;
    let (tx, mut rx) = mpsc::channel::<(Job<Box<dyn Any + Send + 'static>>, Reply)>(QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some((job, reply_tx)) = rx.recv().await {
            let result: Result<Box<dyn Any + Send + 'static>> = conn
                .immediate_transaction::<_, StorageError, _>(|c| job(c).map_err(StorageError::from))
                .map_err(|e| {
                    error!("Write job failed: {}", e);
                    e.into()
                });

            // The requester may have given up waiting.
            let _ = reply_tx.send(result);
        }
        debug!("Writer actor stopped");
    });

    Ok(WriteHandle { tx })
}
