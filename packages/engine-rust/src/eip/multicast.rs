use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::Exchange;

use super::fanout::{BranchSpec, Branches, FanOut};
use crate::engine::{AsyncProcessor, Completion, SharedProcessor};

/// Sends a copy of the exchange to a fixed list of processors.
pub struct Multicast {
    outputs: Arc<[SharedProcessor]>,
    fan_out: FanOut,
}

impl Multicast {
    pub fn new(outputs: Vec<SharedProcessor>, fan_out: FanOut) -> Self {
        Self {
            outputs: outputs.into(),
            fan_out,
        }
    }
}

#[async_trait]
impl AsyncProcessor for Multicast {
    fn process(&self, exchange: Exchange) -> Completion {
        let outputs = Arc::clone(&self.outputs);
        let branches: Branches = Box::new((0..outputs.len()).map(move |index| {
            let output = Arc::clone(&outputs[index]);
            let label = output.label().to_string();
            Ok(BranchSpec::new(output, label))
        }));
        Completion::from_future(self.fan_out.clone().run(exchange, branches))
    }

    fn label(&self) -> &str {
        "multicast"
    }

    async fn start(&self) -> anyhow::Result<()> {
        for output in self.outputs.iter() {
            output.start().await?;
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut first_error = None;
        for output in self.outputs.iter() {
            if let Err(err) = output.stop().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
