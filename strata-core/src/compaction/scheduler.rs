//! Per-partition compaction ticks and the periodic driver

use super::{
    CompactionContext, CompactionTask, CompactionTaskManager, CrossCompactionTask, FileSelector,
    InnerCompactionTask, MergeResource,
};
use crate::config::{CompactionConfig, CompactionPriority};
use crate::management::TsFileManagement;
use crate::resource::TsFileResource;
use crate::{Result, StrataError};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chooses compaction candidates and submits them within the global budget
pub struct CompactionScheduler {
    config: CompactionConfig,
    context: CompactionContext,
    task_manager: Arc<CompactionTaskManager>,
}

impl CompactionScheduler {
    pub fn new(
        config: CompactionConfig,
        context: CompactionContext,
        task_manager: Arc<CompactionTaskManager>,
    ) -> Self {
        Self {
            config,
            context,
            task_manager,
        }
    }

    /// Run one tick for a partition. Returns the number of submitted tasks.
    pub fn schedule(&self, management: &Arc<TsFileManagement>) -> usize {
        let _selection = management.selection_lock().lock();
        let mut submitted = 0;

        match self.config.compaction_priority {
            CompactionPriority::Balance => loop {
                let mut progress = self.select_inner(management, true);
                progress += self.select_inner(management, false);
                match self.select_cross(management) {
                    Ok(n) => progress += n,
                    Err(e) => {
                        warn!(
                            "Cross compaction selection of {}[{}] failed, skipping: {}",
                            management.storage_group(),
                            management.partition(),
                            e
                        );
                        return submitted + progress;
                    }
                }
                submitted += progress;
                if progress == 0 {
                    break;
                }
            },
            CompactionPriority::InnerCross => {
                submitted += self.select_inner(management, true);
                submitted += self.select_inner(management, false);
                submitted += self.cross_or_skip(management);
            }
            CompactionPriority::CrossInner => {
                submitted += self.cross_or_skip(management);
                submitted += self.select_inner(management, true);
                submitted += self.select_inner(management, false);
            }
        }

        if submitted > 0 {
            debug!(
                "Submitted {} compaction tasks for {}[{}]",
                submitted,
                management.storage_group(),
                management.partition()
            );
        }
        submitted
    }

    fn cross_or_skip(&self, management: &Arc<TsFileManagement>) -> usize {
        self.select_cross(management).unwrap_or_else(|e| {
            warn!(
                "Cross compaction selection of {}[{}] failed, skipping: {}",
                management.storage_group(),
                management.partition(),
                e
            );
            0
        })
    }

    /// Scan newest to oldest, submitting each run that reaches the target
    /// size plus a final shorter run of at least two files
    fn select_inner(&self, management: &Arc<TsFileManagement>, seq: bool) -> usize {
        let enabled = if seq {
            self.config.enable_seq_space_compaction
        } else {
            self.config.enable_unseq_space_compaction
        };
        if !enabled {
            return 0;
        }

        let target_size = self.config.target_compaction_file_size;
        let mut run: Vec<Arc<TsFileResource>> = Vec::new();
        let mut run_size = 0u64;
        let mut submitted = 0;

        for file in management.reverse_iter(seq) {
            let size = file.file_size();
            if !file.is_closed() || file.is_merging() || size >= target_size {
                run.clear();
                run_size = 0;
                continue;
            }
            run.push(file);
            run_size += size;
            if run_size >= target_size {
                if !self.submit_inner(management, seq, std::mem::take(&mut run)) {
                    return submitted;
                }
                submitted += 1;
                run_size = 0;
            }
        }
        if run.len() >= 2 && self.submit_inner(management, seq, run) {
            submitted += 1;
        }
        submitted
    }

    fn submit_inner(
        &self,
        management: &Arc<TsFileManagement>,
        seq: bool,
        mut files: Vec<Arc<TsFileResource>>,
    ) -> bool {
        let permit = match self.task_manager.try_reserve() {
            Some(permit) => permit,
            None => return false,
        };
        files.reverse();
        for file in &files {
            file.set_merging(true);
        }
        let task =
            InnerCompactionTask::new(Arc::clone(management), seq, files, self.context.clone());
        self.task_manager.submit(CompactionTask::Inner(task), permit)
    }

    fn select_cross(&self, management: &Arc<TsFileManagement>) -> Result<usize> {
        if !self.config.enable_cross_space_compaction
            || management.is_compacting()
            || management.is_unseq_merging()
        {
            return Ok(0);
        }
        let (seq_files, unseq_files) = management.fork();
        if seq_files.is_empty() || unseq_files.is_empty() {
            return Ok(0);
        }
        let permit = match self.task_manager.try_reserve() {
            Some(permit) => permit,
            None => return Ok(0),
        };

        let resource = MergeResource::new();
        let selection = FileSelector::new(
            &resource,
            self.config.merge_memory_budget,
            self.config.merge_file_strategy,
            self.config.time_lower_bound(),
            self.config.max_open_file_num_in_cross_space_compaction,
        )
        .select(&seq_files, &unseq_files)?;
        let selection = match selection {
            Some(selection) => selection,
            None => return Ok(0),
        };

        info!(
            storage_group = %management.storage_group(),
            partition = management.partition(),
            "Selected {} seq and {} unseq files for cross compaction, estimated {} bytes",
            selection.seq_files.len(),
            selection.unseq_files.len(),
            selection.total_cost
        );
        for file in selection.seq_files.iter().chain(&selection.unseq_files) {
            file.set_merging(true);
        }
        let task = CrossCompactionTask::new(
            Arc::clone(management),
            selection.seq_files,
            selection.unseq_files,
            resource,
            self.context.clone(),
        );
        Ok(usize::from(
            self.task_manager.submit(CompactionTask::Cross(task), permit),
        ))
    }
}

/// Runs a callback on a fixed interval on its own thread until stopped
pub struct CompactionDriver {
    shutdown_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionDriver {
    pub fn start(interval: Duration, on_tick: impl Fn() + Send + 'static) -> Result<Self> {
        if interval.is_zero() {
            return Err(StrataError::Config(
                "compaction interval must be positive".into(),
            ));
        }
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("compaction-driver".into())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(ticker) -> _ => on_tick(),
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("Compaction driver exits");
            })?;
        info!("Compaction driver started, interval {:?}", interval);
        Ok(Self {
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.shutdown_tx.send(());
            if handle.join().is_err() {
                warn!("Compaction driver panicked");
            }
        }
    }
}

impl Drop for CompactionDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
