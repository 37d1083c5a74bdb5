use crate::comm::Reducer;
use crate::prelude::{DestripeError, DestripeResult};
use ndarray::Array1;
use std::fmt;

/// Ownership of a block of amplitudes across the reduction group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmplitudeScope {
    /// Every worker holds distinct amplitudes.
    Local,
    /// Every worker holds a replica of the same amplitudes.
    ///
    /// Offset and subharmonic blocks are always `Local`. A template whose
    /// amplitudes are common to all detectors, such as a per-pixel sky
    /// offset, would return this from `Template::scope`.
    Shared,
}

#[derive(Debug, Clone)]
pub struct AmplitudeBlock {
    pub name: String,
    pub scope: AmplitudeScope,
    pub values: Array1<f64>,
}

impl AmplitudeBlock {
    pub fn zeros(name: impl Into<String>, len: usize, scope: AmplitudeScope) -> Self {
        Self {
            name: name.into(),
            scope,
            values: Array1::zeros(len),
        }
    }

    pub fn from_values(name: impl Into<String>, values: Array1<f64>) -> Self {
        Self {
            name: name.into(),
            scope: AmplitudeScope::Local,
            values,
        }
    }
}

/// Template coefficients, one block per registered template.
#[derive(Debug, Clone, Default)]
pub struct TemplateAmplitudes {
    blocks: Vec<AmplitudeBlock>,
}

impl TemplateAmplitudes {
    pub fn from_blocks(blocks: Vec<AmplitudeBlock>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[AmplitudeBlock] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> &Array1<f64> {
        &self.blocks[index].values
    }

    pub fn block_mut(&mut self, index: usize) -> &mut Array1<f64> {
        &mut self.blocks[index].values
    }

    pub fn get(&self, name: &str) -> Option<&Array1<f64>> {
        self.blocks
            .iter()
            .find(|block| block.name == name)
            .map(|block| &block.values)
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().map(|block| block.values.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            blocks: self
                .blocks
                .iter()
                .map(|block| AmplitudeBlock::zeros(block.name.clone(), block.values.len(), block.scope))
                .collect(),
        }
    }

    fn check_shape(&self, other: &TemplateAmplitudes) -> DestripeResult<()> {
        let matches = self.blocks.len() == other.blocks.len()
            && self
                .blocks
                .iter()
                .zip(&other.blocks)
                .all(|(a, b)| a.name == b.name && a.values.len() == b.values.len());
        if matches {
            Ok(())
        } else {
            Err(DestripeError::LayoutMismatch(
                "template amplitudes have different blocks".into(),
            ))
        }
    }

    /// self += alpha * other
    pub fn axpy(&mut self, alpha: f64, other: &TemplateAmplitudes) -> DestripeResult<()> {
        self.check_shape(other)?;
        for (mine, theirs) in self.blocks.iter_mut().zip(&other.blocks) {
            mine.values.scaled_add(alpha, &theirs.values);
        }
        Ok(())
    }

    pub fn add_assign(&mut self, other: &TemplateAmplitudes) -> DestripeResult<()> {
        self.axpy(1.0, other)
    }

    pub fn sub_assign(&mut self, other: &TemplateAmplitudes) -> DestripeResult<()> {
        self.axpy(-1.0, other)
    }

    pub fn scale(&mut self, factor: f64) {
        for block in &mut self.blocks {
            block.values.mapv_inplace(|value| value * factor);
        }
    }

    /// Distributed dot product.
    ///
    /// Replicated (shared) blocks contribute from the root only; the
    /// per-worker totals are then summed over the whole group.
    pub fn dot(&self, other: &TemplateAmplitudes, reducer: &dyn Reducer) -> DestripeResult<f64> {
        self.check_shape(other)?;
        let mut total = 0.0;
        for (mine, theirs) in self.blocks.iter().zip(&other.blocks) {
            let local = mine.values.dot(&theirs.values);
            total += match mine.scope {
                AmplitudeScope::Local => local,
                AmplitudeScope::Shared if reducer.rank() == 0 => local,
                AmplitudeScope::Shared => 0.0,
            };
        }
        Ok(reducer.all_reduce_sum(total))
    }
}

impl fmt::Display for TemplateAmplitudes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "template amplitudes:")?;
        for block in &self.blocks {
            writeln!(f, "\"{}\" : {} values", block.name, block.values.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SerialReducer, ThreadGroupReducer};
    use ndarray::array;
    use std::thread;

    fn amplitudes() -> TemplateAmplitudes {
        TemplateAmplitudes::from_blocks(vec![
            AmplitudeBlock::from_values("offset", array![1.0, 2.0, 3.0]),
            AmplitudeBlock::from_values("subharmonic", array![4.0, 5.0]),
        ])
    }

    #[test]
    fn arithmetic_is_blockwise() {
        let mut a = amplitudes();
        let b = amplitudes();
        a.axpy(2.0, &b).unwrap();
        assert_eq!(a.block(0).to_vec(), vec![3.0, 6.0, 9.0]);
        a.scale(0.5);
        a.sub_assign(&b).unwrap();
        assert_eq!(a.block(1).to_vec(), vec![2.0, 2.5]);
        assert_eq!(a.len(), 5);
        assert_eq!(a.zeros_like().get("subharmonic").unwrap().sum(), 0.0);
    }

    #[test]
    fn serial_dot_sums_blocks() {
        let a = amplitudes();
        let dot = a.dot(&a, &SerialReducer).unwrap();
        assert!((dot - (1.0 + 4.0 + 9.0 + 16.0 + 25.0)).abs() < 1e-12);
    }

    #[test]
    fn mismatched_blocks_are_rejected() {
        let mut a = amplitudes();
        let b = TemplateAmplitudes::from_blocks(vec![AmplitudeBlock::from_values(
            "offset",
            array![1.0],
        )]);
        assert!(a.add_assign(&b).is_err());
    }

    #[test]
    fn shared_blocks_are_counted_once_across_workers() {
        let dots: Vec<f64> = thread::scope(|scope| {
            let handles: Vec<_> = ThreadGroupReducer::group(3)
                .into_iter()
                .map(|reducer| {
                    scope.spawn(move || {
                        let local = AmplitudeBlock::from_values("offset", array![1.0]);
                        let mut shared = AmplitudeBlock::zeros("common", 2, AmplitudeScope::Shared);
                        shared.values.fill(1.0);
                        let a = TemplateAmplitudes::from_blocks(vec![local, shared]);
                        a.dot(&a, &reducer).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // three local unit amplitudes plus one copy of the shared pair
        assert!(dots.iter().all(|&dot| (dot - 5.0).abs() < 1e-12));
    }
}
