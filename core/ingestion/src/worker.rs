use anyhow::{Context, Result};
use ecu_synth_schemas::ComponentDetails;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub type WorkingSet = BTreeMap<String, ComponentDetails>;

/// A change to one component of the run's working set.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkingSetDelta {
    /// Insert or replace the whole entry.
    Put(ComponentDetails),
    Description { name: String, description: String },
    Details {
        name: String,
        more_description: Option<String>,
        purpose: Option<String>,
    },
    /// Map an IO onto a component already in the set.
    AddIo { component: String, io: String },
}

/// Background task owning the working set; stage workers send it deltas.
pub struct WorkingSetAggregator {
    set: WorkingSet,
    receiver: mpsc::UnboundedReceiver<WorkingSetDelta>,
}

impl WorkingSetAggregator {
    pub fn new(set: WorkingSet, receiver: mpsc::UnboundedReceiver<WorkingSetDelta>) -> Self {
        Self { set, receiver }
    }

    /// Apply deltas until every sender is dropped, then hand the set back.
    pub async fn run(mut self) -> WorkingSet {
        debug!("Working set aggregator started with {} component(s)", self.set.len());

        while let Some(delta) = self.receiver.recv().await {
            self.apply(delta);
        }

        debug!("Working set aggregator drained");
        self.set
    }

    fn apply(&mut self, delta: WorkingSetDelta) {
        match delta {
            WorkingSetDelta::Put(details) => {
                self.set.insert(details.name.clone(), details);
            }
            WorkingSetDelta::Description { name, description } => {
                let entry = self.set.entry(name.clone()).or_insert_with(|| ComponentDetails {
                    name,
                    ..Default::default()
                });
                entry.description = description;
            }
            WorkingSetDelta::Details {
                name,
                more_description,
                purpose,
            } => {
                if let Some(entry) = self.set.get_mut(&name) {
                    if let Some(more_description) = more_description {
                        entry.more_description = more_description;
                    }
                    if let Some(purpose) = purpose {
                        entry.purpose = purpose;
                    }
                }
            }
            WorkingSetDelta::AddIo { component, io } => match self.set.get_mut(&component) {
                Some(entry) if !entry.io.contains(&io) => entry.io.push(io),
                Some(_) => {}
                None => debug!("IO {} maps to {} which is not processable", io, component),
            },
        }
    }
}

/// Running aggregator plus the sender stage workers clone.
pub struct WorkingSetHandle {
    sender: mpsc::UnboundedSender<WorkingSetDelta>,
    task: JoinHandle<WorkingSet>,
}

impl WorkingSetHandle {
    pub fn spawn(initial: WorkingSet) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(WorkingSetAggregator::new(initial, receiver).run());
        Self { sender, task }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<WorkingSetDelta> {
        self.sender.clone()
    }

    /// Stage barrier: close the channel and wait for every delta to land.
    pub async fn finish(self) -> Result<WorkingSet> {
        drop(self.sender);
        let set = self.task.await.context("Working set aggregator panicked")?;
        info!("Working set holds {} component(s)", set.len());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(name: &str) -> ComponentDetails {
        ComponentDetails {
            name: name.to_string(),
            description: format!("{} part", name),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_deltas_from_many_workers_all_land() {
        let mut initial = WorkingSet::new();
        initial.insert("M59".to_string(), details("M59"));
        let handle = WorkingSetHandle::spawn(initial);

        let mut tasks = Vec::new();
        for i in 0..20 {
            let sender = handle.sender();
            tasks.push(tokio::spawn(async move {
                sender
                    .send(WorkingSetDelta::AddIo {
                        component: "M59".to_string(),
                        io: format!("IO{}", i),
                    })
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let set = handle.finish().await.unwrap();
        assert_eq!(set["M59"].io.len(), 20);
    }

    #[tokio::test]
    async fn test_field_updates_do_not_clobber_each_other() {
        let handle = WorkingSetHandle::spawn(WorkingSet::new());
        let sender = handle.sender();
        sender.send(WorkingSetDelta::Put(details("E07"))).unwrap();
        sender
            .send(WorkingSetDelta::Details {
                name: "E07".to_string(),
                more_description: Some("long".to_string()),
                purpose: None,
            })
            .unwrap();
        sender
            .send(WorkingSetDelta::Details {
                name: "E07".to_string(),
                more_description: None,
                purpose: Some("filter".to_string()),
            })
            .unwrap();
        sender
            .send(WorkingSetDelta::AddIo {
                component: "K9".to_string(),
                io: "IO1".to_string(),
            })
            .unwrap();
        drop(sender);

        let set = handle.finish().await.unwrap();
        assert_eq!(set["E07"].more_description, "long");
        assert_eq!(set["E07"].purpose, "filter");
        assert_eq!(set["E07"].description, "E07 part");
        assert!(!set.contains_key("K9"));
    }
}
