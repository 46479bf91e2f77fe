//! `file:` producer: writes message bodies into a directory.
//!
//! Options:
//! - `fileExist`: `Override` (default), `Append`, `Fail` or `Ignore`
//! - `appendChars`: text written after every body
//! - `fileName`: fallback file name when the exchange has no `ConduitFileName` header
//! - `autoCreate`: create the directory on demand (default `true`)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{headers, Exchange, ExchangeError};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Component, Endpoint, EndpointUri};
use crate::engine::{AsyncProcessor, Completion, SharedProcessor};

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileExist {
    #[default]
    Override,
    Append,
    Fail,
    Ignore,
}

impl FromStr for FileExist {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "override" => Ok(Self::Override),
            "append" => Ok(Self::Append),
            "fail" => Ok(Self::Fail),
            "ignore" => Ok(Self::Ignore),
            _ => Err(ExchangeError::IllegalArgument(format!(
                "unknown fileExist option: {s}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct FileComponent;

impl Component for FileComponent {
    fn create_endpoint(&self, uri: &EndpointUri) -> Result<Arc<dyn Endpoint>, ExchangeError> {
        if uri.path().is_empty() {
            return Err(ExchangeError::IllegalArgument(format!(
                "file endpoint needs a directory: {uri}"
            )));
        }
        let file_exist = uri
            .param("fileExist")
            .map(str::parse::<FileExist>)
            .transpose()?
            .unwrap_or_default();
        let auto_create = match uri.param("autoCreate") {
            None => true,
            Some(value) => value.parse::<bool>().map_err(|_| {
                ExchangeError::IllegalArgument(format!("invalid autoCreate option: {value}"))
            })?,
        };

        Ok(Arc::new(FileEndpoint {
            settings: Arc::new(FileSettings {
                uri: uri.as_str().to_string(),
                directory: PathBuf::from(uri.path()),
                file_exist,
                append_chars: uri.param("appendChars").unwrap_or_default().to_string(),
                file_name: uri.param("fileName").map(str::to_string),
                auto_create,
            }),
        }))
    }
}

#[derive(Debug)]
struct FileSettings {
    uri: String,
    directory: PathBuf,
    file_exist: FileExist,
    append_chars: String,
    file_name: Option<String>,
    auto_create: bool,
}

struct FileEndpoint {
    settings: Arc<FileSettings>,
}

#[async_trait]
impl Endpoint for FileEndpoint {
    fn uri(&self) -> &str {
        &self.settings.uri
    }

    fn create_producer(&self) -> Result<SharedProcessor, ExchangeError> {
        Ok(Arc::new(FileProducer {
            label: format!("to[{}]", self.settings.uri),
            settings: Arc::clone(&self.settings),
        }))
    }
}

struct FileProducer {
    label: String,
    settings: Arc<FileSettings>,
}

impl FileSettings {
    fn target(&self, exchange: &Exchange) -> PathBuf {
        let name = exchange
            .header(headers::FILE_NAME)
            .and_then(conduit_core::Value::to_text)
            .or_else(|| self.file_name.clone())
            .unwrap_or_else(|| exchange.id().to_string());
        self.directory.join(name)
    }

    fn transport_error(&self, message: impl Into<String>) -> ExchangeError {
        ExchangeError::Transport {
            endpoint: self.uri.clone(),
            message: message.into(),
        }
    }

    async fn write(&self, path: &Path, exchange: &Exchange) -> Result<(), ExchangeError> {
        let io_err =
            |err: std::io::Error| self.transport_error(format!("{}: {err}", path.display()));

        if self.auto_create {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let exists = tokio::fs::try_exists(path).await.map_err(io_err)?;
        let mut options = tokio::fs::OpenOptions::new();
        match (self.file_exist, exists) {
            (FileExist::Ignore, true) => {
                debug!(path = %path.display(), "file exists, write skipped");
                return Ok(());
            }
            (FileExist::Fail, true) => {
                return Err(
                    self.transport_error(format!("file already exists: {}", path.display()))
                );
            }
            (FileExist::Append, _) => {
                options.create(true).append(true);
            }
            _ => {
                options.create(true).write(true).truncate(true);
            }
        }

        let mut file = options.open(path).await.map_err(io_err)?;
        file.write_all(&exchange.body().to_bytes()).await.map_err(io_err)?;
        if !self.append_chars.is_empty() {
            file.write_all(self.append_chars.as_bytes()).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        debug!(path = %path.display(), mode = ?self.file_exist, "file written");
        Ok(())
    }
}

impl AsyncProcessor for FileProducer {
    fn process(&self, mut exchange: Exchange) -> Completion {
        let settings = Arc::clone(&self.settings);
        Completion::from_future(async move {
            let path = settings.target(&exchange);
            if let Err(err) = settings.write(&path, &exchange).await {
                exchange.set_exception(err);
            }
            exchange
        })
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::FailureKind;

    use super::*;

    fn producer(dir: &Path, options: &str) -> SharedProcessor {
        let uri = EndpointUri::parse(&format!("file:{}{options}", dir.display())).unwrap();
        FileComponent.create_endpoint(&uri).unwrap().create_producer().unwrap()
    }

    fn named(body: &str, name: &str) -> Exchange {
        let mut exchange = Exchange::with_body(body);
        exchange.in_message_mut().set_header(headers::FILE_NAME, name);
        exchange
    }

    #[test]
    fn parses_file_exist() {
        assert_eq!("Append".parse::<FileExist>().unwrap(), FileExist::Append);
        assert_eq!("fail".parse::<FileExist>().unwrap(), FileExist::Fail);
        assert!("sometimes".parse::<FileExist>().is_err());
    }

    #[tokio::test]
    async fn override_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let producer = producer(dir.path(), "");
        producer.process(named("first", "a.txt")).await;
        let exchange = producer.process(named("second", "a.txt")).await;
        assert!(!exchange.is_failed());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "second");
    }

    #[tokio::test]
    async fn append_adds_chars_after_each_body() {
        let dir = tempfile::tempdir().unwrap();
        let producer = producer(dir.path(), "?fileExist=Append&appendChars=;");
        producer.process(named("a", "log.txt")).await;
        producer.process(named("b", "log.txt")).await;
        assert_eq!(std::fs::read_to_string(dir.path().join("log.txt")).unwrap(), "a;b;");
    }

    #[tokio::test]
    async fn fail_and_ignore_on_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), "old").unwrap();

        let exchange =
            producer(dir.path(), "?fileExist=Fail").process(named("new", "x.txt")).await;
        assert_eq!(exchange.exception().unwrap().kind(), FailureKind::Transport);

        let exchange =
            producer(dir.path(), "?fileExist=Ignore").process(named("new", "x.txt")).await;
        assert!(!exchange.is_failed());
        assert_eq!(std::fs::read_to_string(dir.path().join("x.txt")).unwrap(), "old");
    }

    #[tokio::test]
    async fn falls_back_to_the_exchange_id() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = producer(dir.path(), "").process(Exchange::with_body("x")).await;
        assert!(dir.path().join(exchange.id()).exists());
    }
}
