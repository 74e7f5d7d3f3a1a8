//! Test helpers shared by the modules of the node.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use tempfile::TempDir;

use crate::{
    loader::RegistryLoader,
    plan::{DataLoader, DataManager, Metrics, PlanError, TrainingPlan},
};
use fedlab_core::{
    args::{LoaderArgs, TestingArgs, TrainingArguments},
    exchange::{ArtifactExchange, DownloadResponse, ExchangeError, FsExchange, UploadResponse},
    message::{AggregatorArg, AggregatorArgs, TrainingResult, AGGREGATOR_CORRECTION_ARG},
    ArgBag,
    DataType,
    DatasetDescriptor,
    Params,
    PlanKind,
    Tensor,
};

pub const CONSTANT_CLASS: &str = "ConstantPlan";

/// The source of the constant plan: the value its testing routine reports.
pub const CONSTANT_SOURCE: &str = "0.5";

mockall::mock! {
    pub Exchange {}

    #[async_trait]
    impl ArtifactExchange for Exchange {
        async fn upload(&self, path: &Path) -> Result<UploadResponse, ExchangeError>;
        async fn download(
            &self,
            handle: &str,
            dest_name: &str,
        ) -> Result<DownloadResponse, ExchangeError>;
    }
}

/// A plan with a single `weight` layer. Every optimizer step adds `lr * (1 + correction)` to the
/// weight, where the correction is the `weight` of the `aggregator_correction` argument.
pub struct ConstantPlan {
    value: f64,
    params: Params,
    correction: f64,
    fail_training: bool,
}

impl ConstantPlan {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            params: Params::new(),
            correction: 0.0,
            fail_training: false,
        }
    }
}

impl TrainingPlan for ConstantPlan {
    fn kind(&self) -> PlanKind {
        PlanKind::Gradient
    }

    fn post_init(
        &mut self,
        model_args: &ArgBag,
        _args: &TrainingArguments,
    ) -> Result<(), PlanError> {
        self.fail_training = model_args
            .get("fail_training")
            .and_then(|value| value.as_bool())
            .unwrap_or_default();
        Ok(())
    }

    fn set_aggregator_args(&mut self, args: &AggregatorArgs) -> Result<(), PlanError> {
        if let Some(AggregatorArg::Params(correction)) = args.get(AGGREGATOR_CORRECTION_ARG) {
            self.correction = correction.layer("weight")?.data()[0];
        }
        Ok(())
    }

    fn load_params(&mut self, params: Params) -> Result<(), PlanError> {
        params.layer("weight")?;
        self.params = params;
        Ok(())
    }

    fn params(&self) -> Params {
        self.params.clone()
    }

    fn training_data(
        &mut self,
        dataset: &DatasetDescriptor,
        loader: &LoaderArgs,
    ) -> Result<DataManager, PlanError> {
        let len = dataset.shape.first().copied().unwrap_or_default();
        Ok(DataManager::new(len, *loader))
    }

    fn training_routine(
        &mut self,
        loader: &DataLoader,
        args: &TrainingArguments,
    ) -> Result<u32, PlanError> {
        if self.fail_training {
            return Err(anyhow!("training diverged"));
        }
        let mut steps = 0;
        for _ in 0..args.epochs {
            for (i, _batch) in loader.batches().enumerate() {
                if args.batch_maxnum > 0 && i as u32 >= args.batch_maxnum {
                    break;
                }
                let weight = self
                    .params
                    .get_mut("weight")
                    .ok_or_else(|| anyhow!("no weight"))?;
                weight.data_mut()[0] += args.lr * (1.0 + self.correction);
                steps += 1;
                if args.dry_run {
                    return Ok(steps);
                }
            }
        }
        Ok(steps)
    }

    fn testing_routine(
        &mut self,
        _loader: &DataLoader,
        _args: &TestingArgs,
        _before_training: bool,
    ) -> Result<Metrics, PlanError> {
        let mut metrics = Metrics::new();
        metrics.insert("constant".to_string(), self.value);
        Ok(metrics)
    }
}

/// A loader knowing the constant plan only.
pub fn constant_loader() -> RegistryLoader {
    RegistryLoader::new().register(CONSTANT_CLASS, |source: &str| {
        let value: f64 = source.trim().parse()?;
        Ok(Box::new(ConstantPlan::new(value)) as Box<dyn TrainingPlan>)
    })
}

/// A dataset `d1` of `len` samples.
pub fn dataset(len: usize) -> DatasetDescriptor {
    DatasetDescriptor {
        dataset_id: "d1".into(),
        name: "constant".into(),
        tags: vec!["test".into()],
        path: PathBuf::from("/data/d1"),
        data_type: DataType::Default,
        shape: vec![len],
        dtypes: Vec::new(),
        description: String::new(),
    }
}

pub fn empty_bag() -> ArgBag {
    ArgBag::new()
}

/// An exchange in a temporary directory, holding the constant plan and an initial weight.
pub struct TestExchange {
    pub dir: TempDir,
    pub exchange: FsExchange,
    pub plan_source: String,
    pub plan_url: String,
    pub params_url: String,
}

impl TestExchange {
    pub async fn new(weight: f64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let exchange = FsExchange::new(dir.path().join("store"), dir.path().join("downloads"));

        let plan_path = dir.path().join("plan.txt");
        std::fs::write(&plan_path, CONSTANT_SOURCE).unwrap();
        let plan_url = exchange.upload(&plan_path).await.unwrap().handle;

        let mut params = Params::new();
        params.insert("weight", Tensor::from_vec(vec![weight]));
        let params_path = dir.path().join("params.bin");
        params.save(&params_path).unwrap();
        let params_url = exchange.upload(&params_path).await.unwrap().handle;

        Self {
            dir,
            exchange,
            plan_source: CONSTANT_SOURCE.to_string(),
            plan_url,
            params_url,
        }
    }

    /// The local copy of the initial parameters.
    pub fn params_path(&self) -> PathBuf {
        self.dir.path().join("params.bin")
    }

    pub async fn upload_params(&self, name: &str, params: &Params) -> String {
        let path = self.dir.path().join(name);
        params.save(&path).unwrap();
        self.exchange.upload(&path).await.unwrap().handle
    }

    /// Downloads and decodes an uploaded training result.
    pub async fn result(&self, handle: &str) -> TrainingResult {
        let response = self.exchange.download(handle, "result.bin").await.unwrap();
        assert!(response.is_ok());
        let bytes = std::fs::read(&response.path).unwrap();
        std::fs::remove_file(&response.path).unwrap();
        TrainingResult::from_bytes(&bytes).unwrap()
    }

    pub fn downloads_are_empty(&self) -> bool {
        match std::fs::read_dir(self.exchange.download_dir()) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}
