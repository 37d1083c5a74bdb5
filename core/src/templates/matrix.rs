use super::Template;
use crate::amplitudes::{AmplitudeBlock, TemplateAmplitudes};
use crate::prelude::{DestripeError, DestripeResult};
use crate::signal::{Signal, SignalLayout};
use std::sync::Arc;

/// The template matrix F mapping amplitudes to time-domain signals.
#[derive(Debug, Clone)]
pub struct TemplateMatrix {
    layout: Arc<SignalLayout>,
    templates: Vec<Template>,
}

impl TemplateMatrix {
    pub fn new(layout: Arc<SignalLayout>) -> Self {
        Self {
            layout,
            templates: Vec::new(),
        }
    }

    /// Appends a template; amplitude blocks follow registration order.
    pub fn register_template(&mut self, template: impl Into<Template>) {
        self.templates.push(template.into());
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn layout(&self) -> &Arc<SignalLayout> {
        &self.layout
    }

    /// Total amplitude count of this worker.
    pub fn namplitude(&self) -> usize {
        self.templates.iter().map(Template::namplitude).sum()
    }

    pub fn zero_amplitudes(&self) -> TemplateAmplitudes {
        TemplateAmplitudes::from_blocks(
            self.templates
                .iter()
                .map(|template| {
                    AmplitudeBlock::zeros(template.name(), template.namplitude(), template.scope())
                })
                .collect(),
        )
    }

    pub fn zero_signal(&self) -> Signal {
        Signal::zeros(Arc::clone(&self.layout))
    }

    fn check_amplitudes(&self, amplitudes: &TemplateAmplitudes) -> DestripeResult<()> {
        let matches = amplitudes.blocks().len() == self.templates.len()
            && amplitudes
                .blocks()
                .iter()
                .zip(&self.templates)
                .all(|(block, template)| {
                    block.name == template.name() && block.values.len() == template.namplitude()
                });
        if matches {
            Ok(())
        } else {
            Err(DestripeError::LayoutMismatch(
                "amplitudes do not match the registered templates".into(),
            ))
        }
    }

    fn check_signal(&self, signal: &Signal) -> DestripeResult<()> {
        if **signal.layout() == *self.layout {
            Ok(())
        } else {
            Err(DestripeError::LayoutMismatch(
                "signal does not match the template layout".into(),
            ))
        }
    }

    /// signal += F·a
    pub fn add_to_signal(
        &self,
        signal: &mut Signal,
        amplitudes: &TemplateAmplitudes,
    ) -> DestripeResult<()> {
        self.check_amplitudes(amplitudes)?;
        self.check_signal(signal)?;
        for (index, template) in self.templates.iter().enumerate() {
            template.add_to_signal(signal, amplitudes.block(index).view());
        }
        Ok(())
    }

    /// F·a in a fresh signal.
    pub fn apply(&self, amplitudes: &TemplateAmplitudes) -> DestripeResult<Signal> {
        let mut signal = self.zero_signal();
        self.add_to_signal(&mut signal, amplitudes)?;
        Ok(signal)
    }

    /// Fᵗ·signal in fresh amplitudes.
    pub fn apply_transpose(&self, signal: &Signal) -> DestripeResult<TemplateAmplitudes> {
        self.check_signal(signal)?;
        let mut amplitudes = self.zero_amplitudes();
        for (index, template) in self.templates.iter().enumerate() {
            template.project_signal(signal, amplitudes.block_mut(index));
        }
        Ok(amplitudes)
    }

    /// output += C_a⁻¹·input
    pub fn add_prior(
        &self,
        input: &TemplateAmplitudes,
        output: &mut TemplateAmplitudes,
    ) -> DestripeResult<()> {
        self.check_amplitudes(input)?;
        self.check_amplitudes(output)?;
        for (index, template) in self.templates.iter().enumerate() {
            template.add_prior(input.block(index).view(), output.block_mut(index));
        }
        Ok(())
    }

    pub fn apply_precond(&self, input: &TemplateAmplitudes) -> DestripeResult<TemplateAmplitudes> {
        self.check_amplitudes(input)?;
        let mut output = self.zero_amplitudes();
        for (index, template) in self.templates.iter().enumerate() {
            template.apply_precond(input.block(index).view(), output.block_mut(index));
        }
        Ok(output)
    }

    /// signal −= F·a
    pub fn clean_signal(
        &self,
        signal: &mut Signal,
        amplitudes: &TemplateAmplitudes,
    ) -> DestripeResult<()> {
        let model = self.apply(amplitudes)?;
        signal.sub_assign(&model)
    }
}
