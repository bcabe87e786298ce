use std::{
    future::Future,
    io::{self, Write},
};

use env_logger::Builder;
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};

use crate::{config, core::CoordResult, internal_error};

pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender
            .send(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    /// Install the global logger. Records go to the log file when one is
    /// configured, stderr otherwise; `RUST_LOG` overrides the level.
    ///
    /// With a log file the returned task drains piped records into it until
    /// `shutdown` flips to true.
    pub fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> CoordResult<Option<JoinHandle<CoordResult<()>>>> {
        let (mut builder, drain) = self.prepare(shutdown);
        builder
            .try_init()
            .map_err(|e| internal_error!("Failed to install logger: {}", e))?;
        Ok(drain.map(tokio::spawn))
    }

    /// The pipe target is only installed together with the future that
    /// drains it.
    fn prepare(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (
        Builder,
        Option<impl Future<Output = CoordResult<()>> + Send + 'static>,
    ) {
        let mut builder = Builder::new();
        builder
            .filter(None, self.config.level_filter())
            .parse_env(env_logger::Env::default());
        if self.config.path.is_none() {
            return (builder, None);
        }
        let writer = self.create_async_writer();
        builder.target(env_logger::Target::Pipe(Box::new(writer)));
        (builder, Some(self.run(shutdown)))
    }

    /// Write piped records to the log file until `shutdown` flips to true or
    /// every writer is gone. Returns immediately when no file is configured.
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> CoordResult<()> {
        let Some(log_file_path) = self.config.path.clone() else {
            return Ok(());
        };
        // Only writers handed to the logger keep the channel open
        drop(self.sender);

        if let Some(parent) = std::path::Path::new(&log_file_path).parent() {
            if metadata(parent).await.is_err() {
                create_dir_all(parent)
                    .await
                    .map_err(|e| internal_error!("Failed to create log path: {}", e))?;
            }
        }

        let mut file = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&log_file_path)
                .await
                .map_err(|e| internal_error!("Failed to open or create log file: {}", e))?,
        );

        loop {
            tokio::select! {
                biased;
                // Shutdown signal handling
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        while let Ok(data) = self.receiver.try_recv() {
                            if let Err(e) = file.write_all(&data).await {
                                log::error!("Failed to write to log file: {}", e);
                            }
                        }
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                log::error!("Failed to write to log file: {}", e);
                            }
                        }
                        None => {
                            log::info!("Log channel closed, stopping write log");
                            break;
                        }
                    }
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| internal_error!("Failed to flush log file: {}", e))
    }
}
