//! A linear regression training plan trained by plain gradient descent.
//!
//! The plan source is a JSON object naming the number of features, e.g. `{"features": 2}`. The
//! datasets are CSV files without header where each row holds the features followed by the
//! target.

use std::{fs, io, path::Path};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

use fedlab_core::{
    args::{LoaderArgs, TestingArgs, TrainingArguments},
    message::{AggregatorArg, AggregatorArgs, AGGREGATOR_CORRECTION_ARG},
    ArgBag,
    DatasetDescriptor,
    Params,
    PlanKind,
    Tensor,
};
use fedlab_node::{
    plan::{DataLoader, DataManager, Metrics, PlanError, TrainingPlan},
    RegistryLoader,
};

pub const LINEAR_CLASS: &str = "LinearRegression";

const WEIGHT: &str = "weight";
const BIAS: &str = "bias";

#[derive(Debug, Deserialize)]
struct LinearSource {
    features: usize,
}

/// A plan loader knowing the linear regression plan.
pub fn loader() -> RegistryLoader {
    RegistryLoader::new().register(LINEAR_CLASS, |source| {
        let plan: Box<dyn TrainingPlan> = Box::new(LinearRegression::from_source(source)?);
        Ok(plan)
    })
}

/// The source of a plan with `features` features.
pub fn source(features: usize) -> String {
    format!("{{\"features\": {}}}", features)
}

/// The parameters of an untrained model.
pub fn initial_params(features: usize) -> Params {
    let mut params = Params::new();
    params.insert(WEIGHT, Tensor::from_vec(vec![0.0; features]));
    params.insert(BIAS, Tensor::from_vec(vec![0.0]));
    params
}

/// Splits parameters into the weights and the bias.
pub fn coefficients(params: &Params) -> Result<(Vec<f64>, f64), PlanError> {
    let weight = params.layer(WEIGHT)?.data().to_vec();
    let bias = params
        .layer(BIAS)?
        .data()
        .first()
        .copied()
        .ok_or_else(|| anyhow!("the bias is empty"))?;
    Ok((weight, bias))
}

/// Writes `samples` rows of `y = weight . x + bias` into a CSV file.
///
/// The features are deterministic, `offset` shifts them so that each node holds other samples.
pub fn write_dataset(
    path: &Path,
    weight: &[f64],
    bias: f64,
    samples: usize,
    offset: usize,
) -> io::Result<()> {
    let mut csv = String::new();
    for i in 0..samples {
        let x = (0..weight.len())
            .map(|j| ((i + offset + 1) as f64 * (j + 1) as f64 * 0.7).sin())
            .collect::<Vec<_>>();
        let y = dot(weight, &x) + bias;
        let row = x
            .iter()
            .chain(std::iter::once(&y))
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        csv.push_str(&row);
        csv.push('\n');
    }
    fs::write(path, csv)
}

fn dot(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(l, r)| l * r).sum()
}

pub struct LinearRegression {
    features: usize,
    weight: Vec<f64>,
    bias: f64,
    correction: Option<(Vec<f64>, f64)>,
    samples: Vec<(Vec<f64>, f64)>,
}

impl LinearRegression {
    pub fn new(features: usize) -> Self {
        Self {
            features,
            weight: vec![0.0; features],
            bias: 0.0,
            correction: None,
            samples: Vec::new(),
        }
    }

    /// Parses a plan source.
    ///
    /// # Errors
    /// Fails if the source isn't a JSON object naming a positive number of features.
    pub fn from_source(source: &str) -> Result<Self, PlanError> {
        let source: LinearSource =
            serde_json::from_str(source).context("invalid linear regression source")?;
        if source.features == 0 {
            bail!("a linear regression needs at least one feature");
        }
        Ok(Self::new(source.features))
    }

    fn predict(&self, x: &[f64]) -> f64 {
        dot(&self.weight, x) + self.bias
    }

    fn parse_row(&self, line: &str) -> Result<(Vec<f64>, f64), PlanError> {
        let mut values = line
            .split(',')
            .map(|value| value.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid row {:?}", line))?;
        if values.len() != self.features + 1 {
            bail!(
                "expected {} columns, got {} in row {:?}",
                self.features + 1,
                values.len(),
                line
            );
        }
        let target = values.pop().unwrap_or_default();
        Ok((values, target))
    }

    fn step(&mut self, batch: &[usize], lr: f64) -> Result<(), PlanError> {
        let n = batch.len() as f64;
        let mut grad_weight = vec![0.0; self.features];
        let mut grad_bias = 0.0;
        for index in batch {
            let (x, y) = self
                .samples
                .get(*index)
                .ok_or_else(|| anyhow!("no sample {}", index))?;
            let error = self.predict(x) - y;
            for (grad, x) in grad_weight.iter_mut().zip(x) {
                *grad += error * x / n;
            }
            grad_bias += error / n;
        }
        if let Some((weight, bias)) = &self.correction {
            for (grad, correction) in grad_weight.iter_mut().zip(weight) {
                *grad += correction;
            }
            grad_bias += bias;
        }
        for (weight, grad) in self.weight.iter_mut().zip(&grad_weight) {
            *weight -= lr * grad;
        }
        self.bias -= lr * grad_bias;
        Ok(())
    }
}

impl TrainingPlan for LinearRegression {
    fn kind(&self) -> PlanKind {
        PlanKind::Gradient
    }

    fn post_init(
        &mut self,
        _model_args: &ArgBag,
        args: &TrainingArguments,
    ) -> Result<(), PlanError> {
        if !args.lr.is_finite() {
            bail!("the learning rate must be finite");
        }
        Ok(())
    }

    fn set_aggregator_args(&mut self, args: &AggregatorArgs) -> Result<(), PlanError> {
        self.correction = match args.get(AGGREGATOR_CORRECTION_ARG) {
            Some(AggregatorArg::Params(correction)) => {
                let (weight, bias) = coefficients(correction)?;
                if weight.len() != self.features {
                    bail!("the correction doesn't match the model");
                }
                Some((weight, bias))
            }
            Some(other) => bail!("unexpected correction {:?}", other),
            None => None,
        };
        Ok(())
    }

    fn load_params(&mut self, params: Params) -> Result<(), PlanError> {
        let (weight, bias) = coefficients(&params)?;
        if weight.len() != self.features {
            bail!(
                "expected {} weights, got {}",
                self.features,
                weight.len()
            );
        }
        self.weight = weight;
        self.bias = bias;
        Ok(())
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert(WEIGHT, Tensor::from_vec(self.weight.clone()));
        params.insert(BIAS, Tensor::from_vec(vec![self.bias]));
        params
    }

    fn training_data(
        &mut self,
        dataset: &DatasetDescriptor,
        loader: &LoaderArgs,
    ) -> Result<DataManager, PlanError> {
        let csv = fs::read_to_string(&dataset.path)
            .with_context(|| format!("can't read {:?}", dataset.path))?;
        self.samples = csv
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.parse_row(line))
            .collect::<Result<_, _>>()?;
        Ok(DataManager::new(self.samples.len(), *loader))
    }

    fn training_routine(
        &mut self,
        loader: &DataLoader,
        args: &TrainingArguments,
    ) -> Result<u32, PlanError> {
        let mut steps = 0;
        for _ in 0..args.epochs {
            for (i, batch) in loader.batches().enumerate() {
                if args.batch_maxnum > 0 && i as u32 >= args.batch_maxnum {
                    break;
                }
                self.step(batch, args.lr)?;
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
        loader: &DataLoader,
        _args: &TestingArgs,
        _before_training: bool,
    ) -> Result<Metrics, PlanError> {
        let mut squared = 0.0;
        for index in loader.indices() {
            let (x, y) = self
                .samples
                .get(*index)
                .ok_or_else(|| anyhow!("no sample {}", index))?;
            squared += (self.predict(x) - y).powi(2);
        }
        let mut metrics = Metrics::new();
        metrics.insert("mse".into(), squared / loader.len().max(1) as f64);
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use fedlab_core::DataType;

    use super::*;

    fn args(lr: f64) -> TrainingArguments {
        TrainingArguments {
            lr,
            epochs: 20,
            dry_run: false,
            batch_maxnum: 0,
        }
    }

    fn trained_plan(dir: &Path, samples: usize) -> (LinearRegression, DataManager) {
        let path = dir.join("data.csv");
        write_dataset(&path, &[2.0, -1.0], 0.5, samples, 0).unwrap();
        let mut plan = LinearRegression::from_source(&source(2)).unwrap();
        let descriptor = DatasetDescriptor {
            dataset_id: "data".into(),
            name: "data".into(),
            tags: vec![],
            path,
            data_type: DataType::Csv,
            shape: vec![samples, 3],
            dtypes: vec!["float64".into(); 3],
            description: String::new(),
        };
        let manager = plan
            .training_data(&descriptor, &LoaderArgs { batch_size: 10 })
            .unwrap();
        (plan, manager)
    }

    #[test]
    fn test_invalid_source() {
        assert!(LinearRegression::from_source("{}").is_err());
        assert!(LinearRegression::from_source(&source(0)).is_err());
    }

    #[test]
    fn test_training_reduces_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut plan, manager) = trained_plan(dir.path(), 40);
        let (train, _) = manager.split(0.0);
        let train = train.unwrap();
        let testing = TestingArgs {
            test_ratio: 0.0,
            test_on_local_updates: false,
            test_on_global_updates: false,
            test_metric: None,
            test_metric_args: ArgBag::new(),
        };

        let before = plan.testing_routine(&train, &testing, true).unwrap()["mse"];
        let steps = plan.training_routine(&train, &args(0.5)).unwrap();
        let after = plan.testing_routine(&train, &testing, false).unwrap()["mse"];
        assert_eq!(steps, 80);
        assert!(after < before / 100.0, "{} >= {}", after, before);
    }

    #[test]
    fn test_batch_maxnum_and_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let (mut plan, manager) = trained_plan(dir.path(), 40);
        let (train, _) = manager.split(0.0);
        let train = train.unwrap();
        let mut args = args(0.1);
        args.epochs = 2;
        args.batch_maxnum = 3;
        assert_eq!(plan.training_routine(&train, &args).unwrap(), 6);
        args.dry_run = true;
        assert_eq!(plan.training_routine(&train, &args).unwrap(), 1);
    }

    #[test]
    fn test_params_round_trip() {
        let mut plan = LinearRegression::new(2);
        let mut params = initial_params(2);
        params.insert(WEIGHT, Tensor::from_vec(vec![1.0, 2.0]));
        plan.load_params(params.clone()).unwrap();
        assert_eq!(plan.params(), params);
        assert!(plan.load_params(initial_params(3)).is_err());
    }

    #[test]
    fn test_correction_shape_is_checked() {
        let mut plan = LinearRegression::new(2);
        let mut args = AggregatorArgs::new();
        args.insert(
            AGGREGATOR_CORRECTION_ARG.into(),
            AggregatorArg::Params(initial_params(3)),
        );
        assert!(plan.set_aggregator_args(&args).is_err());
        args.insert(
            AGGREGATOR_CORRECTION_ARG.into(),
            AggregatorArg::Params(initial_params(2)),
        );
        plan.set_aggregator_args(&args).unwrap();
        assert!(plan.correction.is_some());
    }
}
