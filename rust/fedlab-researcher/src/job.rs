//! The job of an experiment.
//!
//! The job owns the global model and the replies of every round. It ships the training plan and
//! the global model to the nodes through the artifact exchange and fetches their results back.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fedlab_core::{
    exchange::{ArtifactExchange, ExchangeError},
    message::{
        AggregatorArg,
        AggregatorArgs,
        ModelStatusReply,
        TrainReply,
        TrainRequest,
        TrainingData,
        TrainingResult,
    },
    ArgBag,
    JobId,
    ModelError,
    NodeId,
    Params,
    ResearcherId,
    Timing,
};

use crate::{
    breakpoint::{
        self,
        AggregatedParamsRecord,
        Breakpoint,
        BreakpointDir,
        BreakpointError,
        ComponentState,
    },
    datasets::FederatedDataset,
    requests::{RequestCoordinator, RoundReplies},
};

/// Errors of a job. They are fatal to the experiment.
#[derive(Debug, Display, Error)]
pub enum JobError {
    /// Failed to upload {0:?}: {1}.
    Upload(PathBuf, ExchangeError),
    /// Failed to store the parameters: {0}.
    Params(#[from] ModelError),
    /// Failed to access the experiment directory: {0}.
    Io(#[from] io::Error),
    /// Failed to write the breakpoint: {0}.
    Breakpoint(#[from] BreakpointError),
}

/// What a job is made of.
#[derive(Clone, Debug)]
pub struct JobConfig {
    pub researcher_id: ResearcherId,
    /// The training plan source.
    pub plan_path: PathBuf,
    pub plan_class: String,
    pub model_args: ArgBag,
    pub training_args: ArgBag,
    /// Where the global models are written.
    pub experiment_dir: PathBuf,
    /// Whether aggregator arguments holding parameters are uploaded instead of inlined.
    pub upload_args: bool,
}

/// The outcome of a round on one node, as kept by the researcher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingReply {
    pub node_id: NodeId,
    pub success: bool,
    pub msg: String,
    pub dataset_id: Option<String>,
    pub sample_size: Option<usize>,
    pub timing: Timing,
    /// The downloaded training result.
    pub params_path: Option<PathBuf>,
    #[serde(skip)]
    pub params: Option<Params>,
    #[serde(skip)]
    pub optimizer_args: BTreeMap<String, f64>,
}

/// The state of a job in a breakpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub training_replies: BTreeMap<u32, Vec<TrainingReply>>,
    pub model_params_path: PathBuf,
}

/// What happened to the nodes of a round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoundReport {
    /// Nodes which reported an error. They left the federation.
    pub faulty: Vec<NodeId>,
    /// Nodes which did not reply in time.
    pub missing: Vec<NodeId>,
}

pub struct Job {
    id: JobId,
    config: JobConfig,
    fds: FederatedDataset,
    exchange: Arc<dyn ArtifactExchange>,
    plan_url: String,
    params: Params,
    params_path: PathBuf,
    params_url: String,
    aggregated_params: BTreeMap<u32, PathBuf>,
    training_replies: BTreeMap<u32, Vec<TrainingReply>>,
}

impl Job {
    /// Creates a job and uploads its training plan and initial parameters.
    ///
    /// # Errors
    /// Fails if the plan or the parameters can't be uploaded.
    pub async fn new(
        config: JobConfig,
        fds: FederatedDataset,
        params: Params,
        exchange: Arc<dyn ArtifactExchange>,
    ) -> Result<Self, JobError> {
        fs::create_dir_all(&config.experiment_dir).await?;
        let params_path = config.experiment_dir.join("aggregated_params_init.bin");
        params.save(&params_path)?;
        let job = Self::start(
            JobId::random(),
            config,
            fds,
            params,
            params_path,
            exchange,
        )
        .await?;
        info!("job {} created", job.id);
        Ok(job)
    }

    /// Restores a job from a breakpoint stored in `dir`.
    ///
    /// The training plan and the global model are uploaded again.
    ///
    /// # Errors
    /// Fails if the files of the breakpoint can't be read or uploaded.
    pub async fn restore(
        breakpoint: &Breakpoint,
        dir: &Path,
        experiment_dir: PathBuf,
        upload_args: bool,
        exchange: Arc<dyn ArtifactExchange>,
    ) -> Result<Self, JobError> {
        let config = JobConfig {
            researcher_id: breakpoint.researcher_id.clone(),
            plan_path: breakpoint::resolve(dir, &breakpoint.model_path),
            plan_class: breakpoint.model_class.clone(),
            model_args: breakpoint.model_args.clone(),
            training_args: breakpoint.training_args.clone(),
            experiment_dir,
            upload_args,
        };
        fs::create_dir_all(&config.experiment_dir).await?;
        let params_path = breakpoint::resolve(dir, &breakpoint.job.model_params_path);
        let params = Params::load(&params_path)?;
        let mut job = Self::start(
            breakpoint.job_id.clone(),
            config,
            breakpoint.training_data.clone(),
            params,
            params_path,
            exchange,
        )
        .await?;

        job.aggregated_params = breakpoint
            .aggregated_params
            .iter()
            .map(|(round, record)| (*round, breakpoint::resolve(dir, &record.params_path)))
            .collect();
        job.training_replies = breakpoint.job.training_replies.clone();
        for reply in job.training_replies.values_mut().flatten() {
            reply.params_path = reply
                .params_path
                .as_ref()
                .map(|path| breakpoint::resolve(dir, path));
        }
        info!(
            "job {} restored from {:?} after {} rounds",
            job.id, dir, breakpoint.round_number
        );
        Ok(job)
    }

    async fn start(
        id: JobId,
        config: JobConfig,
        fds: FederatedDataset,
        params: Params,
        params_path: PathBuf,
        exchange: Arc<dyn ArtifactExchange>,
    ) -> Result<Self, JobError> {
        let plan_url = upload(exchange.as_ref(), &config.plan_path).await?;
        let params_url = upload(exchange.as_ref(), &params_path).await?;
        Ok(Self {
            id,
            config,
            fds,
            exchange,
            plan_url,
            params,
            params_path,
            params_url,
            aggregated_params: BTreeMap::new(),
            training_replies: BTreeMap::new(),
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn researcher_id(&self) -> &ResearcherId {
        &self.config.researcher_id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// The federated dataset, without the nodes which left.
    pub fn fds(&self) -> &FederatedDataset {
        &self.fds
    }

    pub fn plan_url(&self) -> &str {
        &self.plan_url
    }

    /// The current global model.
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_path(&self) -> &Path {
        &self.params_path
    }

    pub fn params_url(&self) -> &str {
        &self.params_url
    }

    pub fn aggregated_params(&self) -> &BTreeMap<u32, PathBuf> {
        &self.aggregated_params
    }

    /// The replies of a round.
    pub fn training_replies(&self, round: u32) -> &[TrainingReply] {
        self.training_replies
            .get(&round)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Runs a round on `nodes`: dispatches the requests, collects the replies and fetches the
    /// results.
    ///
    /// Nodes which report an error leave the federated dataset. With `training` false, the nodes
    /// only validate the global model.
    ///
    /// # Errors
    /// Fails if aggregator arguments can't be uploaded.
    pub async fn start_round(
        &mut self,
        coordinator: &mut RequestCoordinator,
        round: u32,
        nodes: &[NodeId],
        mut aggregator_args: BTreeMap<NodeId, AggregatorArgs>,
        training: bool,
    ) -> Result<RoundReport, JobError> {
        let started = Instant::now();
        let mut requests = BTreeMap::new();
        for node_id in nodes {
            let args = aggregator_args.remove(node_id).unwrap_or_default();
            let args = self.prepare_aggregator_args(round, node_id, args).await?;
            requests.insert(node_id.clone(), self.request(round, node_id, args, training));
        }

        let RoundReplies { replies, faulty } =
            coordinator.dispatch_round(&self.id, round, requests).await;
        let elapsed = started.elapsed().as_secs_f64();
        for node_id in faulty.keys() {
            if self.fds.remove(node_id).is_some() {
                warn!("node {} leaves the experiment", node_id);
            }
        }

        let mut records = Vec::with_capacity(replies.len());
        for (_, reply) in replies {
            records.push(self.record(round, reply, elapsed, training).await);
        }
        let missing = nodes
            .iter()
            .filter(|node_id| {
                !faulty.contains_key(*node_id)
                    && !records.iter().any(|reply| &reply.node_id == *node_id)
            })
            .cloned()
            .collect();
        self.training_replies.insert(round, records);

        Ok(RoundReport {
            faulty: faulty.into_iter().map(|(node_id, _)| node_id).collect(),
            missing,
        })
    }

    fn request(
        &self,
        round: u32,
        node_id: &NodeId,
        aggregator_args: AggregatorArgs,
        training: bool,
    ) -> TrainRequest {
        let mut training_data = TrainingData::new();
        if let Some(datasets) = self.fds.get(node_id) {
            let ids = datasets
                .iter()
                .map(|dataset| dataset.dataset_id.clone())
                .collect();
            training_data.insert(node_id.clone(), ids);
        }
        TrainRequest {
            researcher_id: self.config.researcher_id.clone(),
            job_id: self.id.clone(),
            round,
            training_args: self.config.training_args.clone(),
            model_args: self.config.model_args.clone(),
            training_data,
            plan_url: self.plan_url.clone(),
            plan_class: self.config.plan_class.clone(),
            params_url: self.params_url.clone(),
            training,
            aggregator_args,
        }
    }

    /// Replaces the parameters in the aggregator arguments by handles, if uploads are enabled.
    async fn prepare_aggregator_args(
        &self,
        round: u32,
        node_id: &NodeId,
        args: AggregatorArgs,
    ) -> Result<AggregatorArgs, JobError> {
        if !self.config.upload_args {
            return Ok(args);
        }
        let mut prepared = AggregatorArgs::new();
        for (name, arg) in args {
            let arg = match arg {
                AggregatorArg::Params(params) => {
                    let path = self
                        .config
                        .experiment_dir
                        .join(format!("aggregator_{}_{}_{}.bin", name, round, file_stem(node_id)));
                    params.save(&path)?;
                    let url = upload(self.exchange.as_ref(), &path).await?;
                    AggregatorArg::Remote { url }
                }
                arg => arg,
            };
            prepared.insert(name, arg);
        }
        Ok(prepared)
    }

    async fn record(
        &self,
        round: u32,
        reply: TrainReply,
        elapsed: f64,
        training: bool,
    ) -> TrainingReply {
        let mut record = TrainingReply {
            node_id: reply.node_id,
            success: reply.success,
            msg: reply.msg,
            dataset_id: reply.dataset_id,
            sample_size: reply.sample_size,
            timing: Timing {
                rtime_total: Some(elapsed),
                ..reply.timing
            },
            params_path: None,
            params: None,
            optimizer_args: BTreeMap::new(),
        };
        if !record.success || !training {
            return record;
        }
        let fetched = match &reply.params_url {
            Some(url) => self.fetch_result(round, &record.node_id, url).await,
            None => Err("the reply holds no parameters".to_string()),
        };
        match fetched {
            Ok((path, result)) => {
                debug!("fetched the result of node {} into {:?}", record.node_id, path);
                record.params_path = Some(path);
                record.params = Some(result.model_params);
                record.optimizer_args = result.optimizer_args;
            }
            Err(msg) => {
                warn!("failed to fetch the result of node {}: {}", record.node_id, msg);
                record.success = false;
                record.msg = msg;
            }
        }
        record
    }

    async fn fetch_result(
        &self,
        round: u32,
        node_id: &NodeId,
        url: &str,
    ) -> Result<(PathBuf, TrainingResult), String> {
        let name = format!("node_params_{}_{}.bin", round, file_stem(node_id));
        let response = self
            .exchange
            .download(url, &name)
            .await
            .map_err(|err| format!("Cannot download the result {}: {}", url, err))?;
        if !response.is_ok() {
            return Err(format!(
                "Cannot download the result {}: status {}",
                url, response.status
            ));
        }
        let bytes = fs::read(&response.path)
            .await
            .map_err(|err| format!("Cannot read the result {:?}: {}", response.path, err))?;
        let result = TrainingResult::from_bytes(&bytes)
            .map_err(|err| format!("Cannot decode the result {:?}: {}", response.path, err))?;
        if &result.node_id != node_id || result.job_id != self.id {
            return Err(format!(
                "The result {} belongs to node {} of job {}",
                url, result.node_id, result.job_id
            ));
        }
        Ok((response.path, result))
    }

    /// Replaces the global model by the aggregated parameters of `round` and uploads them.
    ///
    /// # Errors
    /// Fails if the parameters can't be stored or uploaded.
    pub async fn update_parameters(&mut self, round: u32, params: Params) -> Result<(), JobError> {
        let path = self
            .config
            .experiment_dir
            .join(format!("aggregated_params_{}.bin", round));
        params.save(&path)?;
        self.params_url = upload(self.exchange.as_ref(), &path).await?;
        self.params = params;
        self.params_path = path.clone();
        self.aggregated_params.insert(round, path);
        debug!("global parameters of round {} uploaded as {}", round, self.params_url);
        Ok(())
    }

    /// Asks the nodes whether they approved the training plan.
    pub async fn check_plan_approved(
        &self,
        coordinator: &mut RequestCoordinator,
    ) -> BTreeMap<NodeId, ModelStatusReply> {
        coordinator
            .model_status(&self.id, &self.plan_url, &self.fds.node_ids())
            .await
    }

    /// Builds the breakpoint of the job, linking its files into `dir`.
    ///
    /// # Errors
    /// Fails if the files can't be linked.
    pub fn breakpoint(
        &self,
        dir: &BreakpointDir,
        round_number: u32,
        round_number_due: u32,
        aggregator: ComponentState,
        node_selection_strategy: ComponentState,
        tags: Vec<String>,
    ) -> Result<Breakpoint, JobError> {
        let aggregated_params = self
            .aggregated_params
            .iter()
            .map(|(round, path)| {
                let params_path = dir.link(path)?;
                Ok((*round, AggregatedParamsRecord { params_path }))
            })
            .collect::<Result<_, BreakpointError>>()?;

        let mut training_replies = self.training_replies.clone();
        for reply in training_replies.values_mut().flatten() {
            if let Some(path) = &reply.params_path {
                reply.params_path = Some(dir.link(path)?);
            }
        }

        Ok(Breakpoint {
            researcher_id: self.config.researcher_id.clone(),
            job_id: self.id.clone(),
            round_number,
            round_number_due,
            training_data: self.fds.clone(),
            training_args: self.config.training_args.clone(),
            model_args: self.config.model_args.clone(),
            model_path: dir.link(&self.config.plan_path)?,
            model_class: self.config.plan_class.clone(),
            aggregator,
            node_selection_strategy,
            tags,
            aggregated_params,
            job: JobState {
                training_replies,
                model_params_path: dir.link(&self.params_path)?,
            },
        })
    }
}

const MAX_STEM_LEN: usize = 64;

/// Turns a node id into a file name component.
///
/// Ids made of ASCII alphanumerics, `-` and `_` are kept as they are. Other ids are sanitized and
/// suffixed with a random id, so they can neither leave the directory nor collide.
fn file_stem(node_id: &NodeId) -> String {
    let is_plain = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    let id = node_id.as_str();
    if !id.is_empty() && id.len() <= MAX_STEM_LEN && id.chars().all(is_plain) {
        return id.to_string();
    }
    let stem: String = id
        .chars()
        .take(MAX_STEM_LEN)
        .map(|c| if is_plain(c) { c } else { '_' })
        .collect();
    format!("{}_{}", stem, Uuid::new_v4().to_simple())
}

async fn upload(exchange: &dyn ArtifactExchange, path: &Path) -> Result<String, JobError> {
    exchange
        .upload(path)
        .await
        .map(|response| response.handle)
        .map_err(|err| JobError::Upload(path.to_path_buf(), err))
}
