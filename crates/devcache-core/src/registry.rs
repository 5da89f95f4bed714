//! Named ownership of programs and buffers
//!
//! A [`Registry`] owns [`Program`]s and [`Buffer`]s under string names so
//! that callers can launch kernels by name without threading handles
//! through their own code.

use crate::buffer::Buffer;
use crate::context::DeviceContext;
use crate::error::{Error, Result};
use crate::program::Program;
use devcache_backends::WorkRange;
use devcache_tracing::perf_span;
use std::collections::HashMap;

#[derive(Debug)]
pub struct Registry {
    ctx: DeviceContext,
    programs: HashMap<String, Program>,
    buffers: HashMap<String, Buffer>,
}

impl Registry {
    pub fn new(ctx: &DeviceContext) -> Self {
        Self {
            ctx: ctx.clone(),
            programs: HashMap::new(),
            buffers: HashMap::new(),
        }
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Take ownership of `program` under `name`
    ///
    /// A program already registered under `name` is destroyed. A program
    /// from another context is rejected with [`Error::InvalidState`] and
    /// dropped.
    pub fn insert_program(&mut self, name: impl Into<String>, program: Program) -> Result<()> {
        let name = name.into();
        if !program.context().same_context(&self.ctx) {
            return Err(Error::invalid_state(format!(
                "program '{name}' belongs to a different device context"
            )));
        }
        match self.programs.insert(name.clone(), program) {
            Some(mut old) => {
                tracing::debug!(name = %name, "replacing registered program");
                old.destroy()
            }
            None => Ok(()),
        }
    }

    /// Take ownership of `buffer` under `name`
    ///
    /// A buffer already registered under `name` is destroyed. A buffer from
    /// another context is rejected with [`Error::InvalidState`] and dropped.
    pub fn insert_buffer(&mut self, name: impl Into<String>, buffer: Buffer) -> Result<()> {
        let name = name.into();
        if !buffer.context().same_context(&self.ctx) {
            return Err(Error::invalid_state(format!(
                "buffer '{name}' belongs to a different device context"
            )));
        }
        match self.buffers.insert(name.clone(), buffer) {
            Some(mut old) => {
                tracing::debug!(name = %name, "replacing registered buffer");
                old.destroy()
            }
            None => Ok(()),
        }
    }

    /// Allocate a global buffer of `size` elements and register it
    pub fn alloc(&mut self, name: impl Into<String>, size: usize) -> Result<&mut Buffer> {
        let name = name.into();
        let buffer = self.ctx.alloc(size)?;
        self.insert_buffer(name.clone(), buffer)?;
        self.buffer_mut(&name)
    }

    /// The program registered as `name`, compiling it on first request
    ///
    /// A compile failure is returned and nothing is registered.
    pub fn get_or_compile(&mut self, name: &str, source: &str, entry_point: &str) -> Result<&mut Program> {
        if !self.programs.contains_key(name) {
            let program = Program::compile(&self.ctx, source, entry_point)?;
            self.programs.insert(name.to_string(), program);
        }
        self.program_mut(name)
    }

    pub fn program(&self, name: &str) -> Result<&Program> {
        self.programs.get(name).ok_or_else(|| unknown("program", name))
    }

    pub fn program_mut(&mut self, name: &str) -> Result<&mut Program> {
        self.programs.get_mut(name).ok_or_else(|| unknown("program", name))
    }

    pub fn buffer(&self, name: &str) -> Result<&Buffer> {
        self.buffers.get(name).ok_or_else(|| unknown("buffer", name))
    }

    pub fn buffer_mut(&mut self, name: &str) -> Result<&mut Buffer> {
        self.buffers.get_mut(name).ok_or_else(|| unknown("buffer", name))
    }

    /// Hand ownership of a program back to the caller
    pub fn remove_program(&mut self, name: &str) -> Option<Program> {
        self.programs.remove(name)
    }

    /// Hand ownership of a buffer back to the caller
    pub fn remove_buffer(&mut self, name: &str) -> Option<Buffer> {
        self.buffers.remove(name)
    }

    /// Bind the named buffers in order and launch the named program
    pub fn run(&mut self, program: &str, buffers: &[&str]) -> Result<()> {
        let args = resolve(&self.buffers, buffers)?;
        let program = self.programs.get_mut(program).ok_or_else(|| unknown("program", program))?;
        program.run_with(&args)
    }

    /// Bind the named buffers in order and launch the named program over `range`
    pub fn run_many(&mut self, program: &str, range: &WorkRange, buffers: &[&str]) -> Result<()> {
        let args = resolve(&self.buffers, buffers)?;
        let program = self.programs.get_mut(program).ok_or_else(|| unknown("program", program))?;
        program.run_many_with(range, &args)
    }

    /// Destroy every owned program, then every owned buffer
    ///
    /// All resources are destroyed even if some fail; the first error is
    /// returned. Calling this on an empty registry is a no-op.
    pub fn destroy_all(&mut self) -> Result<()> {
        let _span = perf_span!("registry_teardown", resources = self.len());
        let mut first_err = None;
        let programs = self.programs.drain().map(|(name, mut p)| (name, p.destroy()));
        let buffers: Vec<_> = self.buffers.drain().collect();
        for (name, result) in programs.chain(buffers.into_iter().map(|(name, mut b)| (name, b.destroy()))) {
            if let Err(err) = result {
                tracing::warn!(name = %name, error = %err, "failed to destroy registered resource");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn program_names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    pub fn buffer_names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    /// Registered programs plus registered buffers
    pub fn len(&self) -> usize {
        self.programs.len() + self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty() && self.buffers.is_empty()
    }
}

fn resolve<'a>(buffers: &'a HashMap<String, Buffer>, names: &[&str]) -> Result<Vec<&'a Buffer>> {
    names
        .iter()
        .map(|name| buffers.get(*name).ok_or_else(|| unknown("buffer", name)))
        .collect()
}

fn unknown(kind: &'static str, name: &str) -> Error {
    Error::UnknownResource {
        kind,
        name: name.to_string(),
    }
}
