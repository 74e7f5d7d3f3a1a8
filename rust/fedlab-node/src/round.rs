//! The execution of one training round on a node.
//!
//! A round goes through the [`RoundStage`]s in order. Any stage may fail, in which case the round
//! ends with a failure reply carrying the cause. [`RoundExecutor::execute`] never fails: every
//! outcome is a [`TrainReply`] for the researcher.

use std::{
    fmt,
    io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use derive_more::Display;
use tokio::{fs, task};
use tracing::{debug, error, error_span, info, warn};
use tracing_futures::Instrument;
use uuid::Uuid;

use fedlab_core::{
    args::{TestingArgs, TrainingArgs},
    exchange::{ArtifactExchange, UploadResponse},
    message::{AggregatorArg, AggregatorArgs, TrainReply, TrainRequest, TrainingResult},
    DatasetDescriptor,
    NodeId,
    Params,
    Timing,
};

use crate::{
    approval::ApprovalGate,
    loader::PlanLoader,
    plan::{DataLoader, Metrics, TrainingPlan},
};

/// The message sent to the researcher when a round fails for reasons the researcher can't fix.
pub const UNEXPECTED_ERROR_MSG: &str =
    "Unexpected error while executing the round. Please contact system provider";

/// The stages of a round, in execution order.
#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum RoundStage {
    #[display(fmt = "Received")]
    Received,
    #[display(fmt = "ArgsValidated")]
    ArgsValidated,
    #[display(fmt = "PlanFetched")]
    PlanFetched,
    #[display(fmt = "Approved")]
    Approved,
    #[display(fmt = "ParamsFetched")]
    ParamsFetched,
    #[display(fmt = "Instantiated")]
    Instantiated,
    #[display(fmt = "ParamsLoaded")]
    ParamsLoaded,
    #[display(fmt = "DataSplit")]
    DataSplit,
    #[display(fmt = "PreValidated")]
    PreValidated,
    #[display(fmt = "Trained")]
    Trained,
    #[display(fmt = "PostValidated")]
    PostValidated,
    #[display(fmt = "ResultUploaded")]
    ResultUploaded,
    #[display(fmt = "RepliedSuccess")]
    RepliedSuccess,
    #[display(fmt = "RepliedFailure")]
    RepliedFailure,
}

/// The outcome of a round.
#[derive(Clone, Debug)]
pub struct RoundOutcome {
    pub reply: TrainReply,
    /// The last stage reached before replying.
    pub last_stage: RoundStage,
    /// The final stage, [`RoundStage::RepliedSuccess`] or [`RoundStage::RepliedFailure`].
    pub stage: RoundStage,
}

/// Files created during a round. They are removed when the round ends, whatever its outcome.
#[derive(Debug, Default)]
struct Teardown(Vec<PathBuf>);

impl Teardown {
    fn push(&mut self, path: PathBuf) {
        self.0.push(path);
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        for path in self.0.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed {:?}", path),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => warn!("failed to remove {:?}: {}", path, err),
            }
        }
    }
}

struct Progress {
    stage: RoundStage,
}

impl Progress {
    fn advance(&mut self, stage: RoundStage) {
        debug_assert!(stage > self.stage, "{} can't follow {}", stage, self.stage);
        debug!("{} -> {}", self.stage, stage);
        self.stage = stage;
    }
}

struct RoundOutput {
    dataset_id: String,
    params_url: Option<String>,
    sample_size: Option<usize>,
    timing: Timing,
}

/// Builds the error of a failed step: `<context>: <error>`.
fn failed<E: fmt::Display>(context: &'static str) -> impl FnOnce(E) -> String {
    move |err| format!("{}: {}", context, err)
}

/// Runs training rounds on behalf of a node.
pub struct RoundExecutor {
    node_id: NodeId,
    gate: Arc<ApprovalGate>,
    loader: Arc<dyn PlanLoader>,
    exchange: Arc<dyn ArtifactExchange>,
    tmp_dir: PathBuf,
}

impl RoundExecutor {
    pub fn new(
        node_id: NodeId,
        gate: Arc<ApprovalGate>,
        loader: Arc<dyn PlanLoader>,
        exchange: Arc<dyn ArtifactExchange>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id,
            gate,
            loader,
            exchange,
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Executes a round of `request` on `dataset`.
    pub async fn execute(
        &self,
        request: &TrainRequest,
        dataset: &DatasetDescriptor,
    ) -> RoundOutcome {
        let span = error_span!(
            "round",
            job_id = %request.job_id,
            round = request.round,
            dataset_id = %dataset.dataset_id,
        );
        self.execute_round(request, dataset).instrument(span).await
    }

    async fn execute_round(
        &self,
        request: &TrainRequest,
        dataset: &DatasetDescriptor,
    ) -> RoundOutcome {
        let mut progress = Progress {
            stage: RoundStage::Received,
        };
        let mut teardown = Teardown::default();
        let result = self.run(request, dataset, &mut progress, &mut teardown).await;
        drop(teardown);

        let mut reply = TrainReply {
            node_id: self.node_id.clone(),
            researcher_id: request.researcher_id.clone(),
            job_id: request.job_id.clone(),
            round: request.round,
            success: false,
            msg: String::new(),
            dataset_id: None,
            params_url: None,
            sample_size: None,
            timing: Timing::default(),
        };
        let stage = match result {
            Ok(output) => {
                info!(
                    "round completed: {} samples in {:.3}s",
                    output.sample_size.unwrap_or_default(),
                    output.timing.rtime_training
                );
                reply.success = true;
                reply.dataset_id = Some(output.dataset_id);
                reply.params_url = output.params_url;
                reply.sample_size = output.sample_size;
                reply.timing = output.timing;
                RoundStage::RepliedSuccess
            }
            Err(msg) => {
                error!("round failed after stage {}: {}", progress.stage, msg);
                reply.msg = msg;
                RoundStage::RepliedFailure
            }
        };
        RoundOutcome {
            reply,
            last_stage: progress.stage,
            stage,
        }
    }

    async fn run(
        &self,
        request: &TrainRequest,
        dataset: &DatasetDescriptor,
        progress: &mut Progress,
        teardown: &mut Teardown,
    ) -> Result<RoundOutput, String> {
        let args = TrainingArgs::from_bag(&request.training_args).map_err(|err| err.to_string())?;
        let training = args.training_arguments();
        let testing = args.testing_arguments();
        let loader_args = args.loader_arguments();
        warn_on_split(&testing);
        progress.advance(RoundStage::ArgsValidated);

        let tag = Uuid::new_v4().to_simple().to_string();
        let plan_path = self
            .fetch(&request.plan_url, &format!("training_plan_{}.plan", tag), teardown)
            .await
            .map_err(|_| format!("Cannot download training plan file: {}", request.plan_url))?;
        let source = fs::read_to_string(&plan_path)
            .await
            .map_err(failed("Cannot read training plan file"))?;
        progress.advance(RoundStage::PlanFetched);

        if self.gate.requires_approval() {
            let outcome = self
                .gate
                .check(source.as_bytes(), &request.plan_class)
                .map_err(failed("Cannot check the approval of the training plan"))?;
            if !outcome.approved {
                return Err(format!(
                    "Requested training plan is not approved by the node: {}",
                    self.node_id
                ));
            }
        }
        progress.advance(RoundStage::Approved);

        let params_path = self
            .fetch(&request.params_url, &format!("my_model_{}.bin", tag), teardown)
            .await
            .map_err(|_| format!("Cannot download param file: {}", request.params_url))?;
        let aggregator_args = self
            .resolve_aggregator_args(&request.aggregator_args, &tag, teardown)
            .await?;
        progress.advance(RoundStage::ParamsFetched);

        let mut plan = self
            .loader
            .load(&request.plan_class, &source)
            .map_err(failed("Cannot instantiate training plan object"))?;
        plan.post_init(&request.model_args, &training)
            .map_err(failed("Can't initialize training plan with the arguments"))?;
        plan.set_aggregator_args(&aggregator_args)
            .map_err(failed("Can't initialize training plan with the arguments"))?;
        progress.advance(RoundStage::Instantiated);

        let params =
            Params::load(&params_path).map_err(failed("Cannot initialize model parameters"))?;
        plan.load_params(params)
            .map_err(failed("Cannot initialize model parameters"))?;
        progress.advance(RoundStage::ParamsLoaded);

        let descriptor = dataset.clone();
        let (mut plan, manager) =
            blocking(plan, move |plan| plan.training_data(&descriptor, &loader_args)).await?;
        let manager = manager.map_err(failed("Can not create validation/train data"))?;
        let (train_loader, test_loader) = manager.split(testing.test_ratio);
        progress.advance(RoundStage::DataSplit);

        if !request.training {
            // a round without training only validates the received parameters
            match test_loader {
                Some(loader) => {
                    validate(plan, loader, testing, true).await?;
                }
                None => warn!("validation requested but there is no validation data"),
            }
            progress.advance(RoundStage::PreValidated);
            return Ok(RoundOutput {
                dataset_id: dataset.dataset_id.clone(),
                params_url: None,
                sample_size: None,
                timing: Timing::default(),
            });
        }

        if testing.test_on_global_updates {
            if let Some(loader) = test_loader.clone() {
                plan = validate(plan, loader, testing.clone(), true).await?;
            }
            progress.advance(RoundStage::PreValidated);
        }

        let train_loader = train_loader.ok_or_else(|| {
            "Can not create validation/train data: no samples left for training".to_string()
        })?;
        let sample_size = train_loader.len();
        let loader = train_loader.clone();
        let (plan, (steps, rtime, ptime)) = blocking(plan, move |plan| {
            let started = Instant::now();
            let cpu_started = process_time();
            let steps = plan.training_routine(&loader, &training);
            (
                steps,
                started.elapsed(),
                process_time().saturating_sub(cpu_started),
            )
        })
        .await?;
        let steps = steps.map_err(failed("Cannot train model in round"))?;
        let timing = Timing {
            rtime_training: rtime.as_secs_f64(),
            ptime_training: ptime.as_secs_f64(),
            rtime_total: None,
        };
        debug!("{} optimizer steps on {} samples", steps, sample_size);
        progress.advance(RoundStage::Trained);

        let plan = match (testing.test_on_local_updates, test_loader) {
            (true, Some(loader)) => {
                let plan = validate(plan, loader, testing, false).await?;
                progress.advance(RoundStage::PostValidated);
                plan
            }
            _ => plan,
        };

        let result = TrainingResult {
            researcher_id: request.researcher_id.clone(),
            job_id: request.job_id.clone(),
            node_id: self.node_id.clone(),
            model_params: plan.params(),
            optimizer_args: plan.optimizer_args(&training),
        };
        drop(plan);
        let bytes = result.to_bytes().map_err(failed("Cannot upload results"))?;
        fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(failed("Cannot upload results"))?;
        let results_path = self.tmp_dir.join(format!("node_params_{}.bin", tag));
        teardown.push(results_path.clone());
        fs::write(&results_path, bytes)
            .await
            .map_err(failed("Cannot upload results"))?;
        let UploadResponse { handle } = self
            .exchange
            .upload(&results_path)
            .await
            .map_err(failed("Cannot upload results"))?;
        progress.advance(RoundStage::ResultUploaded);

        Ok(RoundOutput {
            dataset_id: dataset.dataset_id.clone(),
            params_url: Some(handle),
            sample_size: Some(sample_size),
            timing,
        })
    }

    /// Downloads an artifact and schedules its removal.
    async fn fetch(
        &self,
        handle: &str,
        name: &str,
        teardown: &mut Teardown,
    ) -> Result<PathBuf, String> {
        let response = self.exchange.download(handle, name).await.map_err(|err| {
            warn!("failed to download {}: {}", handle, err);
            err.to_string()
        })?;
        teardown.push(response.path.clone());
        if response.is_ok() {
            Ok(response.path)
        } else {
            warn!("failed to download {}: status {}", handle, response.status);
            Err(format!("status {}", response.status))
        }
    }

    /// Replaces the aggregator arguments uploaded to the exchange by their content.
    async fn resolve_aggregator_args(
        &self,
        args: &AggregatorArgs,
        tag: &str,
        teardown: &mut Teardown,
    ) -> Result<AggregatorArgs, String> {
        let mut resolved = AggregatorArgs::new();
        for (name, arg) in args {
            let arg = match arg {
                AggregatorArg::Remote { url } => {
                    let path = self
                        .fetch(url, &format!("aggregator_args_{}_{}.bin", name, tag), teardown)
                        .await
                        .map_err(|_| {
                            format!("Cannot download aggregator argument {}: {}", name, url)
                        })?;
                    let params = Params::load(&path).map_err(|err| {
                        format!("Cannot load aggregator argument {}: {}", name, err)
                    })?;
                    AggregatorArg::Params(params)
                }
                inline => inline.clone(),
            };
            resolved.insert(name.clone(), arg);
        }
        Ok(resolved)
    }
}

/// Runs a plan call on a blocking thread and hands the plan back.
async fn blocking<T, F>(
    plan: Box<dyn TrainingPlan>,
    f: F,
) -> Result<(Box<dyn TrainingPlan>, T), String>
where
    F: FnOnce(&mut dyn TrainingPlan) -> T + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(move || {
        let mut plan = plan;
        let output = f(plan.as_mut());
        (plan, output)
    })
    .await
    .map_err(|err| {
        error!("training plan task failed: {}", err);
        UNEXPECTED_ERROR_MSG.to_string()
    })
}

/// Runs the testing routine. Failures are logged, they don't fail the round.
async fn validate(
    plan: Box<dyn TrainingPlan>,
    loader: DataLoader,
    testing: TestingArgs,
    before_training: bool,
) -> Result<Box<dyn TrainingPlan>, String> {
    let (plan, metrics) = blocking(plan, move |plan| {
        plan.testing_routine(&loader, &testing, before_training)
    })
    .await?;
    let when = if before_training {
        "global parameters"
    } else {
        "local updates"
    };
    match metrics {
        Ok(metrics) => log_metrics(when, &metrics),
        Err(err) => error!("validation on {} failed: {}", when, err),
    }
    Ok(plan)
}

fn log_metrics(when: &str, metrics: &Metrics) {
    for (name, value) in metrics {
        info!("validation on {}: {} = {}", when, name, value);
    }
}

fn warn_on_split(testing: &TestingArgs) {
    if testing.test_ratio > 0.0 && !testing.requested() {
        warn!(
            "test_ratio is {} but neither test_on_local_updates nor test_on_global_updates is set, \
             no validation will be performed",
            testing.test_ratio
        );
    }
    if testing.test_ratio == 0.0 && testing.requested() {
        warn!("validation is requested but test_ratio is 0, no validation will be performed");
    }
}

/// The CPU time consumed by the whole process.
#[cfg(unix)]
fn process_time() -> Duration {
    let mut time = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `time` is a valid timespec to write into.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut time) };
    if rc == 0 {
        Duration::new(time.tv_sec as u64, time.tv_nsec as u32)
    } else {
        Duration::default()
    }
}

#[cfg(not(unix))]
fn process_time() -> Duration {
    Duration::default()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::{
        approval::MemoryRegistry,
        loader::RegistryLoader,
        testutils::{
            constant_loader,
            dataset,
            empty_bag,
            MockExchange,
            TestExchange,
            CONSTANT_CLASS,
        },
    };
    use fedlab_core::{
        exchange::{DownloadResponse, ExchangeError, STATUS_NOT_FOUND},
        message::AGGREGATOR_CORRECTION_ARG,
        ArgBag,
        Tensor,
    };

    fn request(env: &TestExchange, training_args: ArgBag) -> TrainRequest {
        TrainRequest {
            researcher_id: "researcher".into(),
            job_id: "job".into(),
            round: 0,
            training_args,
            model_args: empty_bag(),
            training_data: BTreeMap::new(),
            plan_url: env.plan_url.clone(),
            plan_class: CONSTANT_CLASS.into(),
            params_url: env.params_url.clone(),
            training: true,
            aggregator_args: AggregatorArgs::new(),
        }
    }

    fn executor(env: &TestExchange, gate: ApprovalGate) -> RoundExecutor {
        RoundExecutor::new(
            "node-1".into(),
            Arc::new(gate),
            Arc::new(constant_loader()),
            Arc::new(env.exchange.clone()),
            env.dir.path().join("tmp"),
        )
    }

    fn open_gate() -> ApprovalGate {
        ApprovalGate::new(false, MemoryRegistry::default())
    }

    fn bag(value: serde_json::Value) -> ArgBag {
        match value {
            serde_json::Value::Object(bag) => bag,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_successful_round() {
        let env = TestExchange::new(1.0).await;
        let executor = executor(&env, open_gate());
        let outcome = executor
            .execute(&request(&env, bag(json!({ "batch_size": 2 }))), &dataset(10))
            .await;

        assert_eq!(outcome.stage, RoundStage::RepliedSuccess);
        assert_eq!(outcome.last_stage, RoundStage::ResultUploaded);
        let reply = outcome.reply;
        assert!(reply.success, "{}", reply.msg);
        assert_eq!(reply.sample_size, Some(10));
        assert_eq!(reply.dataset_id.as_deref(), Some("d1"));

        let result = env.result(reply.params_url.as_ref().unwrap()).await;
        // 5 batches, each step adds lr to the weight
        let weight = result.model_params.get("weight").unwrap().data()[0];
        assert!((weight - (1.0 + 5.0 * 0.01)).abs() < 1e-9);
        assert_eq!(result.optimizer_args.get("lr"), Some(&0.01));
        assert_eq!(result.node_id.as_str(), "node-1");

        // downloaded plan and params, and the local result blob, are gone
        assert!(env.downloads_are_empty());
        assert_eq!(std::fs::read_dir(env.dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let env = TestExchange::new(1.0).await;
        let outcome = executor(&env, open_gate())
            .execute(&request(&env, bag(json!({ "lr": -1.0 }))), &dataset(10))
            .await;
        assert_eq!(outcome.stage, RoundStage::RepliedFailure);
        assert_eq!(outcome.last_stage, RoundStage::Received);
        assert!(outcome.reply.msg.contains("invalid training arguments"));
        assert!(outcome.reply.params_url.is_none());
    }

    #[tokio::test]
    async fn test_unapproved_plan_is_not_executed() {
        let env = TestExchange::new(1.0).await;
        let gate = ApprovalGate::new(true, MemoryRegistry::default());
        let outcome = executor(&env, gate)
            .execute(&request(&env, empty_bag()), &dataset(10))
            .await;
        assert_eq!(outcome.last_stage, RoundStage::PlanFetched);
        assert_eq!(
            outcome.reply.msg,
            "Requested training plan is not approved by the node: node-1"
        );
        assert!(env.downloads_are_empty());
    }

    #[tokio::test]
    async fn test_approved_plan_is_executed() {
        let env = TestExchange::new(1.0).await;
        let gate = ApprovalGate::new(true, MemoryRegistry::default());
        gate.register_approved(env.plan_source.as_bytes(), CONSTANT_CLASS)
            .unwrap();
        let outcome = executor(&env, gate)
            .execute(&request(&env, empty_bag()), &dataset(10))
            .await;
        assert!(outcome.reply.success, "{}", outcome.reply.msg);
    }

    #[tokio::test]
    async fn test_missing_params() {
        let env = TestExchange::new(1.0).await;
        let mut request = request(&env, empty_bag());
        request.params_url = "fs://missing".into();
        let outcome = executor(&env, open_gate()).execute(&request, &dataset(10)).await;
        assert_eq!(outcome.last_stage, RoundStage::Approved);
        assert_eq!(outcome.reply.msg, "Cannot download param file: fs://missing");
    }

    #[tokio::test]
    async fn test_unknown_plan_class() {
        let env = TestExchange::new(1.0).await;
        let mut request = request(&env, empty_bag());
        request.plan_class = "Unknown".into();
        let outcome = executor(&env, open_gate()).execute(&request, &dataset(10)).await;
        assert_eq!(outcome.last_stage, RoundStage::ParamsFetched);
        assert!(outcome
            .reply
            .msg
            .starts_with("Cannot instantiate training plan object"));
    }

    #[tokio::test]
    async fn test_failing_training() {
        let env = TestExchange::new(1.0).await;
        let mut request = request(&env, empty_bag());
        request.model_args = bag(json!({ "fail_training": true }));
        let outcome = executor(&env, open_gate()).execute(&request, &dataset(10)).await;
        assert_eq!(outcome.last_stage, RoundStage::DataSplit);
        assert!(outcome.reply.msg.starts_with("Cannot train model in round"));
        assert!(env.downloads_are_empty());
    }

    #[tokio::test]
    async fn test_no_training_samples() {
        let env = TestExchange::new(1.0).await;
        let outcome = executor(&env, open_gate())
            .execute(
                &request(&env, bag(json!({ "test_ratio": 1.0, "test_on_global_updates": true }))),
                &dataset(10),
            )
            .await;
        assert_eq!(outcome.last_stage, RoundStage::PreValidated);
        assert!(outcome.reply.msg.contains("no samples left for training"));
    }

    #[tokio::test]
    async fn test_validation_stages() {
        let env = TestExchange::new(1.0).await;
        let outcome = executor(&env, open_gate())
            .execute(
                &request(
                    &env,
                    bag(json!({
                        "test_ratio": 0.2,
                        "test_on_global_updates": true,
                        "test_on_local_updates": true,
                    })),
                ),
                &dataset(10),
            )
            .await;
        assert!(outcome.reply.success, "{}", outcome.reply.msg);
        assert_eq!(outcome.reply.sample_size, Some(8));
    }

    #[tokio::test]
    async fn test_validation_only_round() {
        let env = TestExchange::new(1.0).await;
        let mut request = request(
            &env,
            bag(json!({ "test_ratio": 0.5, "test_on_global_updates": true })),
        );
        request.training = false;
        let outcome = executor(&env, open_gate()).execute(&request, &dataset(10)).await;
        assert_eq!(outcome.stage, RoundStage::RepliedSuccess);
        assert_eq!(outcome.last_stage, RoundStage::PreValidated);
        assert!(outcome.reply.params_url.is_none());
        assert!(outcome.reply.sample_size.is_none());
    }

    #[tokio::test]
    async fn test_remote_aggregator_args() {
        let env = TestExchange::new(1.0).await;
        let mut correction = Params::new();
        correction.insert("weight", Tensor::from_vec(vec![1.0]));
        let url = env.upload_params("correction.bin", &correction).await;

        let mut request = request(&env, bag(json!({ "batch_size": 10 })));
        request
            .aggregator_args
            .insert(AGGREGATOR_CORRECTION_ARG.into(), AggregatorArg::Remote { url });
        let outcome = executor(&env, open_gate()).execute(&request, &dataset(10)).await;
        assert!(outcome.reply.success, "{}", outcome.reply.msg);

        // a single step with the correction: 1.0 + lr * (1.0 + 1.0)
        let result = env.result(outcome.reply.params_url.as_ref().unwrap()).await;
        let weight = result.model_params.get("weight").unwrap().data()[0];
        assert!((weight - 1.02).abs() < 1e-9);

        let mut request = request.clone();
        request.aggregator_args.insert(
            AGGREGATOR_CORRECTION_ARG.into(),
            AggregatorArg::Remote {
                url: "fs://missing".into(),
            },
        );
        let outcome = executor(&env, open_gate()).execute(&request, &dataset(10)).await;
        assert!(outcome
            .reply
            .msg
            .starts_with("Cannot download aggregator argument aggregator_correction"));
    }

    #[tokio::test]
    async fn test_failing_exchange() {
        let env = TestExchange::new(1.0).await;
        let dir = env.dir.path().to_path_buf();
        let plan_source = env.plan_source.clone();
        let params = Params::load(env.params_path()).unwrap();

        let mut exchange = MockExchange::new();
        exchange.expect_download().returning(move |handle, name| {
            let path = dir.join(name);
            match handle {
                "plan" => std::fs::write(&path, &plan_source).unwrap(),
                "params" => params.save(&path).unwrap(),
                _ => {
                    return Ok(DownloadResponse {
                        status: STATUS_NOT_FOUND,
                        path,
                    })
                }
            }
            Ok(DownloadResponse { status: 200, path })
        });
        exchange
            .expect_upload()
            .returning(|_| Err(ExchangeError::Transport("connection reset".into())));

        let executor = RoundExecutor::new(
            "node-1".into(),
            Arc::new(open_gate()),
            Arc::new(constant_loader()),
            Arc::new(exchange),
            env.dir.path().join("tmp"),
        );
        let mut request = request(&env, empty_bag());
        request.plan_url = "plan".into();
        request.params_url = "params".into();
        let outcome = executor.execute(&request, &dataset(10)).await;
        assert_eq!(outcome.last_stage, RoundStage::Trained);
        assert_eq!(
            outcome.reply.msg,
            "Cannot upload results: Transfer failed: connection reset."
        );
    }

    #[test]
    fn test_stages_are_ordered() {
        assert!(RoundStage::Received < RoundStage::ArgsValidated);
        assert!(RoundStage::Approved < RoundStage::ParamsFetched);
        assert!(RoundStage::ResultUploaded < RoundStage::RepliedSuccess);
        assert_eq!(RoundStage::DataSplit.to_string(), "DataSplit");
    }

    #[test]
    fn test_registry_loader_is_a_plan_loader() {
        let loader: Arc<dyn PlanLoader> = Arc::new(RegistryLoader::new());
        assert!(loader.load(CONSTANT_CLASS, "1.0").is_err());
    }
}
