use super::{Campaign, CampaignError, CampaignId, CampaignSettings, CampaignState, Collaborators};
use crate::agent::ExecutionAgent;
use crate::aggregate::CampaignRunSummary;
use crate::protocol::{ProtocolRegistry, ProtocolSpec};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::target::CampaignTarget;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::*;

#[derive(Debug)]
struct Entry {
    campaign: Arc<Campaign>,
    started: bool,
}

/// Owns every campaign of the process. Campaigns share one scheduler, so an agent's
/// concurrency limit holds across all of them. Sessions and fingerprints stay per campaign.
#[derive(Debug)]
pub struct CampaignManager {
    registry: Arc<ProtocolRegistry>,
    agents: Vec<(Arc<dyn ExecutionAgent>, usize)>,
    scheduler_config: SchedulerConfig,
    /// Built with the first campaign
    scheduler: Mutex<Option<Scheduler>>,
    settings: CampaignSettings,
    collaborators: Collaborators,
    campaigns: Mutex<HashMap<CampaignId, Entry>>,
    next_id: Mutex<u64>,
}

impl CampaignManager {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        agents: Vec<(Arc<dyn ExecutionAgent>, usize)>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            registry,
            agents,
            scheduler_config: SchedulerConfig::default(),
            scheduler: Mutex::new(None),
            settings: CampaignSettings::default(),
            collaborators,
            campaigns: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn with_settings(mut self, settings: CampaignSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<ProtocolRegistry> {
        &self.registry
    }

    pub fn register_protocol(&self, spec: ProtocolSpec) -> Result<Arc<ProtocolSpec>, CampaignError> {
        let spec = self.registry.register(spec)?;
        info!("Registered protocol {}", spec.name);
        Ok(spec)
    }

    /// Creates a campaign using the manager's collaborators.
    pub fn create_campaign(&self, targets: Vec<CampaignTarget>) -> Result<CampaignId, CampaignError> {
        self.create_campaign_with(targets, self.collaborators.clone())
    }

    pub fn create_campaign_with(
        &self,
        targets: Vec<CampaignTarget>,
        collaborators: Collaborators,
    ) -> Result<CampaignId, CampaignError> {
        let scheduler = self.scheduler()?;
        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = format!("campaign-{:04}", *next);
            *next += 1;
            id
        };
        let campaign = Campaign::new(
            id.clone(),
            targets,
            self.registry.clone(),
            scheduler,
            collaborators,
            self.settings,
        )?;
        info!("Created {id} with {} targets", campaign.targets().len());
        self.campaigns.lock().unwrap().insert(
            id.clone(),
            Entry {
                campaign: Arc::new(campaign),
                started: false,
            },
        );
        Ok(id)
    }

    fn scheduler(&self) -> Result<Scheduler, CampaignError> {
        let mut shared = self.scheduler.lock().unwrap();
        if let Some(scheduler) = &*shared {
            return Ok(scheduler.clone());
        }
        let scheduler = Scheduler::new(self.agents.clone(), self.scheduler_config)?;
        *shared = Some(scheduler.clone());
        Ok(scheduler)
    }

    pub fn campaign(&self, id: &str) -> Option<Arc<Campaign>> {
        self.campaigns
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.campaign.clone())
    }

    fn existing(&self, id: &str) -> Result<Arc<Campaign>, CampaignError> {
        self.campaign(id)
            .ok_or_else(|| CampaignError::UnknownCampaign(id.to_string()))
    }

    /// Runs the campaign in the background. A campaign starts at most once.
    pub fn start_campaign(&self, id: &str) -> Result<(), CampaignError> {
        let campaign = {
            let mut campaigns = self.campaigns.lock().unwrap();
            let entry = campaigns
                .get_mut(id)
                .ok_or_else(|| CampaignError::UnknownCampaign(id.to_string()))?;
            if entry.started || entry.campaign.state() != CampaignState::Pending {
                return Err(CampaignError::InvalidTransition {
                    id: id.to_string(),
                    from: entry.campaign.state(),
                    to: CampaignState::Running,
                });
            }
            entry.started = true;
            entry.campaign.clone()
        };
        tokio::spawn(campaign.run());
        Ok(())
    }

    pub fn pause_campaign(&self, id: &str) -> Result<(), CampaignError> {
        self.existing(id)?.pause()
    }

    pub fn resume_campaign(&self, id: &str) -> Result<(), CampaignError> {
        self.existing(id)?.resume()
    }

    /// Stops issuing requests. Stopping a finished campaign does nothing.
    pub fn stop_campaign(&self, id: &str) -> Result<(), CampaignError> {
        let campaign = self.existing(id)?;
        if !campaign.state().is_terminal() {
            campaign.stop();
        }
        Ok(())
    }

    /// Waits for the campaign to finish. Only returns for started or stopped campaigns.
    pub async fn wait_campaign(&self, id: &str) -> Result<CampaignRunSummary, CampaignError> {
        let campaign = self.existing(id)?;
        Ok(campaign.wait().await)
    }

    pub fn campaign_state(&self, id: &str) -> Result<CampaignState, CampaignError> {
        Ok(self.existing(id)?.state())
    }

    /// The live summary of a running campaign, the frozen one of a finished campaign.
    pub fn get_campaign_summary(&self, id: &str) -> Result<CampaignRunSummary, CampaignError> {
        Ok(self.existing(id)?.summary())
    }

    pub fn campaign_ids(&self) -> Vec<CampaignId> {
        let mut ids: Vec<_> = self.campaigns.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}
