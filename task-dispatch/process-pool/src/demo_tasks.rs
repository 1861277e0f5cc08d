// Copyright 2025 Umberto Gotti <umberto.gotti@umbertogotti.dev>
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Tasks served by the `task-dispatch` binary, used by its demo and the tests.

use anyhow::{bail, ensure};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use task_dispatch_core::{FoldTask, MapTask, ReduceTask, SlotMut, SlotTask, WorkerContext};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SquareOptions {
    /// Item index that returns an error
    pub fail_on: Option<usize>,
    /// Item index that panics
    pub panic_on: Option<usize>,
    /// Sleep per item, to let items overlap across workers
    pub delay_ms: u64,
    pub fail_init: bool,
    /// Item index on which the worker process exits without a word
    pub exit_on: Option<usize>,
    /// Item index on which the task writes to stdout
    pub print_on: Option<usize>,
}

/// `x -> x * x`
pub struct Square {
    worker: usize,
}

impl MapTask for Square {
    const NAME: &'static str = "square";
    type Input = i64;
    type Output = i64;
    type Options = SquareOptions;

    fn init(context: &WorkerContext, options: &SquareOptions) -> anyhow::Result<Self> {
        if options.fail_init {
            bail!("square refused to start on worker {}", context.worker);
        }
        Ok(Self {
            worker: context.worker,
        })
    }

    fn process(&mut self, input: i64, index: usize, options: &SquareOptions) -> anyhow::Result<i64> {
        if options.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(options.delay_ms));
        }
        if options.fail_on == Some(index) {
            bail!("cannot square item {index} on worker {}", self.worker);
        }
        if options.panic_on == Some(index) {
            panic!("square blew up on item {index}");
        }
        if options.exit_on == Some(index) {
            std::process::exit(7);
        }
        if options.print_on == Some(index) {
            println!("squaring item {index}");
        }
        input
            .checked_mul(input)
            .ok_or_else(|| anyhow::anyhow!("{input} squared overflows"))
    }
}

/// `x -> x / 2`, floats cross the wire as they are, NaN and infinities included
pub struct Halve;

impl MapTask for Halve {
    const NAME: &'static str = "halve";
    type Input = f64;
    type Output = f64;
    type Options = ();

    fn init(_: &WorkerContext, _: &()) -> anyhow::Result<Self> {
        Ok(Halve)
    }

    fn process(&mut self, input: f64, _: usize, _: &()) -> anyhow::Result<f64> {
        Ok(input / 2.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleOptions {
    pub factor: f64,
    pub fail_on: Option<usize>,
    pub delay_ms: u64,
}

impl Default for ScaleOptions {
    fn default() -> Self {
        Self {
            factor: 2.0,
            fail_on: None,
            delay_ms: 0,
        }
    }
}

/// Multiplies every element of the slot by `factor`, in place
pub struct Scale;

impl SlotTask for Scale {
    const NAME: &'static str = "scale";
    type Elem = f64;
    type Options = ScaleOptions;

    fn init(_: &WorkerContext, options: &ScaleOptions) -> anyhow::Result<Self> {
        ensure!(options.factor.is_finite(), "scale factor must be finite");
        Ok(Scale)
    }

    fn process(
        &mut self,
        mut slot: SlotMut<'_, f64>,
        index: usize,
        options: &ScaleOptions,
    ) -> anyhow::Result<()> {
        if options.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(options.delay_ms));
        }
        if options.fail_on == Some(index) {
            bail!("cannot scale item {index}");
        }
        slot.iter_mut().for_each(|v| *v *= options.factor);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SumOptions {
    pub fail_on: Option<usize>,
}

/// Elementwise sum of the items and how many went into it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumPartial {
    pub sum: Vec<f64>,
    pub count: usize,
}

impl SumPartial {
    pub fn mean(&self) -> Vec<f64> {
        match self.count {
            0 => vec![0.0; self.sum.len()],
            n => self.sum.iter().map(|s| s / n as f64).collect(),
        }
    }
}

/// Elementwise sum over every item
pub struct ElementSum {
    partial: Option<SumPartial>,
}

impl ReduceTask for ElementSum {
    const NAME: &'static str = "element-sum";
    type Elem = f64;
    type Options = SumOptions;
    type Partial = SumPartial;

    fn init(_: &WorkerContext, _: &SumOptions) -> anyhow::Result<Self> {
        Ok(Self { partial: None })
    }

    fn map(&mut self, slot: SlotMut<'_, f64>, index: usize, options: &SumOptions) -> anyhow::Result<()> {
        if options.fail_on == Some(index) {
            bail!("cannot sum item {index}");
        }
        let partial = self.partial.get_or_insert_with(|| SumPartial {
            sum: vec![0.0; slot.len()],
            count: 0,
        });
        ensure!(
            partial.sum.len() == slot.len(),
            "item {index} has {} elements, expected {}",
            slot.len(),
            partial.sum.len()
        );
        partial.sum.iter_mut().zip(slot.iter()).for_each(|(s, v)| *s += v);
        partial.count += 1;
        Ok(())
    }

    fn into_partial(self) -> anyhow::Result<Option<SumPartial>> {
        Ok(self.partial)
    }

    fn combine(mut acc: SumPartial, next: SumPartial) -> anyhow::Result<SumPartial> {
        ensure!(
            acc.sum.len() == next.sum.len(),
            "partials of {} and {} elements cannot be combined",
            acc.sum.len(),
            next.sum.len()
        );
        acc.sum.iter_mut().zip(&next.sum).for_each(|(a, b)| *a += b);
        acc.count += next.count;
        Ok(acc)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyOptions {
    pub fail_on: Option<usize>,
    pub delay_ms: u64,
}

/// How many integers a worker saw and their sum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyTotal {
    pub items: usize,
    pub total: i64,
}

/// Running sum of the integers dealt to one worker
pub struct Tally {
    tally: TallyTotal,
}

impl FoldTask for Tally {
    const NAME: &'static str = "tally";
    type Input = i64;
    type Output = TallyTotal;
    type Options = TallyOptions;

    fn init(_: &WorkerContext, _: &TallyOptions) -> anyhow::Result<Self> {
        Ok(Self {
            tally: TallyTotal::default(),
        })
    }

    fn fold(&mut self, input: i64, index: usize, options: &TallyOptions) -> anyhow::Result<()> {
        if options.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(options.delay_ms));
        }
        if options.fail_on == Some(index) {
            bail!("cannot tally item {index}");
        }
        self.tally.total = self
            .tally
            .total
            .checked_add(input)
            .ok_or_else(|| anyhow::anyhow!("tally overflows at item {index}"))?;
        self.tally.items += 1;
        Ok(())
    }

    fn finish(self, _: &TallyOptions) -> anyhow::Result<TallyTotal> {
        Ok(self.tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use task_dispatch_core::Shape;

    #[test]
    fn test_square_reports_overflow() {
        let mut task = Square::init(&WorkerContext::serial(), &SquareOptions::default()).unwrap();
        let options = SquareOptions::default();
        assert_eq!(task.process(-12, 0, &options).unwrap(), 144);
        assert!(task.process(i64::MAX, 1, &options).is_err());
    }

    #[test]
    fn test_partials_combine_into_mean() {
        let shape = Shape::from([2]);
        let options = SumOptions::default();
        let mut left = ElementSum::init(&WorkerContext::serial(), &options).unwrap();
        let mut right = ElementSum::init(&WorkerContext::serial(), &options).unwrap();

        let mut a = [1.0, 2.0];
        let mut b = [3.0, 4.0];
        let mut c = [5.0, 6.0];
        left.map(SlotMut::new(&mut a, &shape), 0, &options).unwrap();
        left.map(SlotMut::new(&mut b, &shape), 1, &options).unwrap();
        right.map(SlotMut::new(&mut c, &shape), 2, &options).unwrap();

        let total = ElementSum::combine(
            left.into_partial().unwrap().unwrap(),
            right.into_partial().unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(total.count, 3);
        assert_eq!(total.sum, vec![9.0, 12.0]);
        assert_eq!(total.mean(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_tally_counts_and_sums() {
        let options = TallyOptions::default();
        let mut task = Tally::init(&WorkerContext::serial(), &options).unwrap();
        task.fold(5, 0, &options).unwrap();
        task.fold(-2, 1, &options).unwrap();
        assert!(task.fold(i64::MAX, 2, &options).is_err());
        assert_eq!(
            task.finish(&options).unwrap(),
            TallyTotal { items: 2, total: 3 }
        );
    }

    #[test]
    fn test_idle_worker_has_no_partial() {
        let task = ElementSum::init(&WorkerContext::serial(), &SumOptions::default()).unwrap();
        assert_eq!(task.into_partial().unwrap(), None);
    }
}
