//! Upkeep thread: write-buffer age flushing, incremental KeyDir resizing,
//! value cache maintenance, TTL reaping and log rotation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::datafile::DATA_ENTRY_HEADER_SIZE;

use super::{StoreInner, Wake};

pub(super) fn upkeep_thread_main(inner: &Arc<StoreInner>) {
    inner.logger.debug("upkeep thread started");
    loop {
        let period = Duration::from_millis(u64::from(inner.config.lock().upkeep_cycle_period_ms));
        match inner.upkeep.wait_cycle(period) {
            Wake::Exit => break,
            Wake::Run => {
                inner.upkeep.clear_work();
                inner.run_upkeep_cycle();
            }
        }
    }
    inner.logger.debug("upkeep thread stopped");
}

impl StoreInner {
    pub(super) fn run_upkeep_cycle(&self) {
        self.update_now();
        let cfg = *self.config.lock();

        self.flush_write_buffer_by_age(cfg.write_buffer_flush_period_ms);

        // First priority: finish a pending KeyDir resize, one batch at a
        // time so writers keep making progress in between
        if self.keydir.is_resizing() {
            self.logger.debug("resizing the keydir in the upkeep thread");
            while self.keydir.is_resizing() {
                self.keydir
                    .background_resize_work(cfg.upkeep_keydir_batch_size);
                std::thread::yield_now();
            }
            self.logger.debug("keydir resize finished");
        }

        // Second priority: cache queue maintenance and the free margin
        self.cache
            .maintain_queues(cfg.upkeep_value_cache_batch_size);
        self.cache
            .preventive_eviction(cfg.upkeep_value_cache_batch_size);

        // Third priority: reap entries whose TTL elapsed
        let reaped = self.keydir.reap_expired(cfg.upkeep_value_cache_batch_size);
        if !reaped.is_empty() {
            let files = self.files.read();
            for entry in &reaped {
                if let Some(df) = files.get(entry.file_id) {
                    df.record_dead(
                        (DATA_ENTRY_HEADER_SIZE + entry.key_size as usize) as u64
                            + u64::from(entry.index_size)
                            + u64::from(entry.value_size),
                    );
                }
            }
            self.logger
                .debug(&format!("reaped {} expired entries", reaped.len()));
        }

        self.logger.rotate_if_needed();
    }

    /// Flushes the write buffer when its content sat unflushed for longer
    /// than the configured period. The comparison against the previous
    /// observation avoids flushing a buffer that writers keep flushing
    /// anyway.
    fn flush_write_buffer_by_age(&self, flush_period_ms: u32) {
        let mut tracker = self.flush_tracker.lock();
        if tracker.last_flush.elapsed() < Duration::from_millis(u64::from(flush_period_ms)) {
            return;
        }
        let _guard = self.active_mutex.lock();
        let files = self.files.read();
        let mut ws = self.write_state.write();
        if ws.flushed_offset == tracker.last_flushed_offset
            && ws.active_file_id == tracker.last_active_file_id
            && ws.data_offset > ws.flushed_offset
        {
            // Failures are already counted and logged by the flush itself
            let _ = self.flush_write_buffer_locked(&mut ws, &files);
        }
        tracker.last_flushed_offset = ws.flushed_offset;
        tracker.last_active_file_id = ws.active_file_id;
        tracker.last_flush = Instant::now();
    }
}
