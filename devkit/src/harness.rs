/*!
Harnais de test du plan de contrôle

Monte un environnement complet en mémoire : broker, agents embarqués,
pool préconfiguré en profil rapide, et helpers d'attente pour les
conditions asynchrones.
*/

use crate::memory_bus::MemoryBroker;
use orbion_host_agent::HostAgent;
use orbion_kernel::config::TimingConfig;
use orbion_kernel::models::HostId;
use orbion_kernel::platform::LocalPlatform;
use orbion_kernel::policy::{FirstFitPolicy, ScalingPolicy};
use orbion_kernel::pool::HostPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct RunningAgent {
    pub host_id: HostId,
    pub agent: Arc<HostAgent>,
    task: JoinHandle<()>,
}

pub struct TestHarness {
    pub broker: MemoryBroker,
    pub timing: TimingConfig,
    agents: Vec<RunningAgent>,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();
        Self {
            broker: MemoryBroker::new(),
            timing: TimingConfig::fast(),
            agents: Vec::new(),
        }
    }

    /// Démarre un agent embarqué qui bat au rythme du profil rapide.
    /// À appeler avant `open_pool` pour qu'il soit classé statique.
    pub async fn spawn_agent(&mut self) -> HostId {
        let heartbeat = Duration::from_millis(self.timing.is_alive_interval_ms);
        let agent = Arc::new(HostAgent::new("127.0.0.1", heartbeat));
        let host_id = agent.host_id();
        let runner = agent.clone();
        let bus = Arc::new(self.broker.handle());
        let task = tokio::spawn(async move {
            if let Err(e) = runner.run(bus).await {
                log::error!("embedded agent failed: {e}");
            }
        });
        // laisse l'agent s'abonner avant de continuer
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.agents.push(RunningAgent { host_id, agent, task });
        host_id
    }

    pub fn agent_handle(&self, host_id: HostId) -> Option<Arc<HostAgent>> {
        self.agents
            .iter()
            .find(|a| a.host_id == host_id)
            .map(|a| a.agent.clone())
    }

    /// Coupe un agent sans adieu : ses heartbeats cessent, le détecteur doit
    /// finir par l'expirer.
    pub fn kill_agent(&mut self, host_id: HostId) {
        if let Some(pos) = self.agents.iter().position(|a| a.host_id == host_id) {
            let running = self.agents.remove(pos);
            running.task.abort();
        }
    }

    /// Arrêt propre d'un agent : il publie son adieu avant de rendre la main.
    pub async fn stop_agent(&mut self, host_id: HostId) {
        if let Some(pos) = self.agents.iter().position(|a| a.host_id == host_id) {
            let running = self.agents.remove(pos);
            running.agent.stop();
            let _ = running.task.await;
        }
    }

    /// Ouvre le pool en profil rapide ; bloque sur la fenêtre de découverte.
    pub async fn open_pool(&self) -> anyhow::Result<Arc<HostPool>> {
        self.open_pool_with(self.timing.clone(), Arc::new(FirstFitPolicy)).await
    }

    pub async fn open_pool_with(
        &self,
        timing: TimingConfig,
        policy: Arc<dyn ScalingPolicy>,
    ) -> anyhow::Result<Arc<HostPool>> {
        let pool = HostPool::open(
            Arc::new(self.broker.handle()),
            timing,
            Arc::new(LocalPlatform::new("small")),
            policy,
            "small".into(),
        )
        .await?;
        Ok(pool)
    }

    /// Sonde une condition jusqu'à son passage à vrai ou l'expiration.
    pub async fn wait_until<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Arrête tous les agents restants.
    pub async fn shutdown(&mut self) {
        for running in self.agents.drain(..) {
            running.agent.stop();
            let _ = running.task.await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
