//! Engine assembly and the main processing loops.
//!
//! The runtime owns the stage registry and the engine state, drives each
//! packet through the stage graph, runs the flow-level chain for expired
//! flows, applies control-socket reconfiguration between packets, and fires
//! the periodic tick (status log, file rollover) on capture-time boundaries.

use crate::classify::metadata::ClassificationMetadata;
use crate::config::RuntimeConfig;
use crate::control::{spawn_control_thread, ControlBlock};
use crate::output::files::FileManager;
use crate::packet::PacketDescriptor;
use crate::registry::StageRegistry;
use crate::stage::{EngineState, StageHandle, Verdict};
use crate::time::TimeVal;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use crossbeam::channel::Receiver;

struct StatusLog {
    file_prefix: String,
    file_postfix: String,
    writer: Option<BufWriter<File>>,
}

pub struct Runtime {
    registry: StageRegistry,
    state: EngineState,
    root: StageHandle,
    descriptor: PacketDescriptor,
    running: Arc<AtomicBool>,
    control_rx: Option<Receiver<ControlBlock>>,
    timer_period: u64,
    next_tick: Option<i64>,
    start_time: Option<TimeVal>,
    status: Option<StatusLog>,
    processed_bytes: u64,
    last_seen_packet: u64,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Runtime> {
        let metadata = match &config.engine.classification {
            Some(path) => Arc::new(ClassificationMetadata::load(path)?),
            None => {
                log::warn!("no classification metadata configured; classifiers are unavailable");
                Arc::new(ClassificationMetadata::empty())
            }
        };

        let files = FileManager::new(
            &config.files.output_directory,
            config.files.split_files,
            config.files.min_free_space,
        );

        let running = Arc::new(AtomicBool::new(true));
        {
            let running = Arc::clone(&running);
            if let Err(e) = ctrlc::set_handler(move || {
                log::warn!("interrupted");
                running.store(false, Ordering::SeqCst);
            }) {
                log::warn!("could not install the termination handler: {}", e);
            }
        }

        let mut registry = StageRegistry::build(&config, &metadata, &running)?;
        let root = registry
            .handle(&config.engine.root_stage)
            .context("active stage not found")?;

        let mut state = EngineState::new(metadata, files);
        for stage in registry.iter_mut() {
            stage.open_new_files(&mut state);
        }
        if state.stop {
            anyhow::bail!("opening initial output files failed");
        }

        let mut status = config.status.as_ref().map(|cfg| StatusLog {
            file_prefix: cfg.file_prefix.clone(),
            file_postfix: cfg.file_postfix.clone(),
            writer: None,
        });
        if let Some(status) = status.as_mut() {
            status.writer = Some(
                state
                    .files
                    .open(&status.file_prefix, &status.file_postfix)
                    .context("opening status log")?,
            );
        }

        let control_rx = if config.engine.control_port != 0 {
            let (rx, _) = spawn_control_thread(config.engine.control_port)?;
            Some(rx)
        } else {
            None
        };

        Ok(Runtime {
            registry,
            state,
            root,
            descriptor: PacketDescriptor::new(),
            running,
            control_rx,
            timer_period: config.engine.timer_period,
            next_tick: None,
            start_time: None,
            status,
            processed_bytes: 0,
            last_seen_packet: 0,
        })
    }

    /// Runs the engine until the source ends or a termination request
    /// arrives, then drains all remaining state.
    pub fn run(&mut self) {
        log::info!("started");
        let wall_start = Instant::now();

        while !self.state.stop && self.running.load(Ordering::Relaxed) {
            let mut verdict = Verdict::Forward(self.root);
            while let Verdict::Forward(handle) = verdict {
                verdict = self
                    .registry
                    .get_mut(handle)
                    .process_packet(&mut self.descriptor, &mut self.state);
            }
            if self.descriptor.packet_number() != self.last_seen_packet {
                self.last_seen_packet = self.descriptor.packet_number();
                self.processed_bytes += self.descriptor.header().caplen as u64;
            }

            self.drain_expired();
            self.apply_control();
            self.tick();
            if self.state.rotate {
                self.rotate();
            }
        }

        log::info!("stopping; draining tables");
        for stage in self.registry.iter_mut() {
            stage.drain(&mut self.state);
        }
        self.drain_expired();
        // The tables are empty now; a second pass only flushes the writers,
        // covering records emitted by the flow chain above.
        for stage in self.registry.iter_mut() {
            stage.drain(&mut self.state);
        }
        self.write_status();
        if let Some(status) = self.status.as_mut() {
            if let Some(writer) = status.writer.as_mut() {
                let _ = writer.flush();
            }
        }

        println!(
            "Processed: {} packets, {} bytes",
            self.last_seen_packet, self.processed_bytes
        );
        println!("Wall time: {:?}ms", wall_start.elapsed().as_millis());
        log::info!("stopped");
    }

    /// Runs each queued expired flow through the flow-level chain, then
    /// through its owning stage for emission.
    fn drain_expired(&mut self) {
        while !self.state.expired.is_empty() {
            let expired = std::mem::take(&mut self.state.expired);
            for item in expired {
                let mut verdict = match item.chain {
                    Some(handle) => Verdict::Forward(handle),
                    None => Verdict::Drop,
                };
                while let Verdict::Forward(handle) = verdict {
                    verdict = self
                        .registry
                        .get_mut(handle)
                        .process_flow(&item.flow, &mut self.state);
                }
                self.registry
                    .get_mut(item.emitter)
                    .process_flow(&item.flow, &mut self.state);
            }
        }
    }

    /// Applies configuration blocks received on the control socket.
    fn apply_control(&mut self) {
        let Some(rx) = &self.control_rx else {
            return;
        };
        let mut blocks = Vec::new();
        while let Ok(block) = rx.try_recv() {
            blocks.push(block);
        }
        for block in blocks {
            for (name, settings) in block {
                if name == "files" || name == "fileManager" {
                    self.state.files.configure(&settings);
                    continue;
                }
                match self.registry.handle(&name) {
                    Some(handle) => self.registry.get_mut(handle).configure(&settings),
                    None => log::warn!(
                        "runtime configuration: no such stage: {}; skipping",
                        name
                    ),
                }
            }
        }
    }

    /// Fires the periodic listeners on capture-time boundaries.
    fn tick(&mut self) {
        if self.timer_period == 0 {
            return;
        }
        let now = self.state.current_time;
        if now.is_zero() {
            return;
        }
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        let next = *self
            .next_tick
            .get_or_insert((now.sec / self.timer_period as i64 + 1) * self.timer_period as i64);
        if now.sec < next {
            return;
        }

        self.write_status();
        if self.state.files.split_files() {
            self.state.rotate = true;
        }

        let mut next = next;
        while next <= now.sec {
            next += self.timer_period as i64;
        }
        self.next_tick = Some(next);
    }

    fn write_status(&mut self) {
        let Some(status) = self.status.as_mut() else {
            return;
        };
        let Some(writer) = status.writer.as_mut() else {
            return;
        };
        let now = self.state.current_time;
        let runtime = self
            .start_time
            .map(|start| now.secs_since(start))
            .unwrap_or(0);
        let (hours, minutes, seconds) = (runtime / 3600, (runtime / 60) % 60, runtime % 60);
        log::info!("runtime: {}h {}m {}s", hours, minutes, seconds);

        let _ = writeln!(
            writer,
            "Status at runtime: {}h {}m {}s",
            hours, minutes, seconds
        );
        for stage in self.registry.iter_mut() {
            let line = stage.get_status(&self.state, runtime, self.timer_period);
            let name = stage.name().to_string();
            let _ = writeln!(writer, "{}: {}", name, line);
        }
        let _ = writeln!(writer);
        let _ = writer.flush();
    }

    /// Rolls all output files over to the next index, stopping the engine
    /// when the output volume runs out of headroom.
    fn rotate(&mut self) {
        self.state.rotate = false;
        if !self.state.files.has_free_space() {
            log::error!("stopping: not enough disk space to open new files");
            self.state.stop = true;
            return;
        }
        self.state.files.advance();
        for stage in self.registry.iter_mut() {
            stage.open_new_files(&mut self.state);
        }
        if let Some(status) = self.status.as_mut() {
            match self.state.files.open(&status.file_prefix, &status.file_postfix) {
                Ok(writer) => status.writer = Some(writer),
                Err(e) => {
                    log::error!("{:#}", e);
                    self.state.stop = true;
                }
            }
        }
    }
}
