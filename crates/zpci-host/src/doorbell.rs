//! MSI doorbell delivery and adapter-interrupt routing.
//!
//! A function's MSI-X messages are rewritten at store time to carry its function id, so a
//! write into the doorbell window names both the function and the vector. Delivery sets the
//! vector's indicator bit (and the summary bit) in guest memory and raises an adapter
//! interrupt when the guest would not otherwise notice.

use crate::event::{PendingEvent, ERR_ADAPTER_RESOURCE, ERR_NO_MSI};
use crate::function::{
    FunctionInner, FunctionState, InterruptConfig, InterruptRegistration, ZpciFunction,
};
use crate::host::{io_int_word, HostControlError};
use crate::indicator::{set_indicator_bit, Indicator, IndicatorError};
use crate::{lock, HostBridge};

/// Vector bits of a doorbell payload.
pub const DOORBELL_VECTOR_MASK: u64 = 0x7ff;
pub const DOORBELL_FID_SHIFT: u32 = 11;

/// Doorbell payload addressing vector `vector` of function `fid`.
pub const fn doorbell_payload(fid: u32, vector: u16) -> u64 {
    ((fid as u64) << DOORBELL_FID_SHIFT) | (vector as u64 & DOORBELL_VECTOR_MASK)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellOutcome {
    Delivered { interrupt_raised: bool },
    UnknownFunction,
    NotEnabled,
    NoInterruptRoute,
    IndicatorUnreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RegisterInterruptsError {
    #[error(transparent)]
    Indicator(#[from] IndicatorError),
    #[error("interrupt forwarding: {0}")]
    Forwarding(#[from] HostControlError),
}

impl HostBridge {
    /// Handles a write of `data` into the doorbell window.
    pub fn doorbell_write(&self, data: u64) -> DoorbellOutcome {
        let fid = (data >> DOORBELL_FID_SHIFT) as u32;
        let vector = (data & DOORBELL_VECTOR_MASK) as u32;
        tracing::trace!(fid, vector, "doorbell write");

        let Some(function) = self.find_by_fid(fid) else {
            self.report_undeliverable(0, fid, vector);
            return DoorbellOutcome::UnknownFunction;
        };
        let inner = lock(&function.inner);
        let fh = inner.fh.raw();
        if inner.state != FunctionState::Enabled {
            drop(inner);
            self.report_undeliverable(fh, fid, vector);
            return DoorbellOutcome::NotEnabled;
        }
        let Some(config) = inner
            .interrupts
            .as_ref()
            .filter(|irq| irq.indicators.is_some())
            .map(|irq| irq.config)
        else {
            drop(inner);
            self.report_undeliverable(fh, fid, vector);
            return DoorbellOutcome::NoInterruptRoute;
        };
        drop(inner);

        match self.deliver(&config, vector) {
            Ok(interrupt_raised) => DoorbellOutcome::Delivered { interrupt_raised },
            Err(err) => {
                tracing::warn!(fid, vector, %err, "indicator write failed");
                self.events
                    .push(PendingEvent::error(ERR_ADAPTER_RESOURCE, 0, 0, 0, 0));
                DoorbellOutcome::IndicatorUnreachable
            }
        }
    }

    /// Value read back from the doorbell window.
    pub fn doorbell_read(&self) -> u32 {
        0xffff_ffff
    }

    fn report_undeliverable(&self, fh: u32, fid: u32, vector: u32) {
        self.events
            .push(PendingEvent::error(ERR_NO_MSI, fh, fid, 0, vector << 16));
    }

    fn deliver(&self, config: &InterruptConfig, vector: u32) -> zpci_mem::GuestMemoryResult<bool> {
        let route = &config.route;
        let ind_bit = u64::from(route.indicator_offset) + u64::from(vector);
        let ind_was_set = set_indicator_bit(&*self.mem, route.indicator_addr, ind_bit)?;
        let raise = if config.summary {
            !set_indicator_bit(
                &*self.mem,
                route.summary_addr,
                u64::from(route.summary_offset),
            )?
        } else {
            !ind_was_set
        };
        if raise {
            self.services.adapters.inject(config.isc, io_int_word(config.isc));
        }
        Ok(raise)
    }

    /// Routes the function's interrupts, either through local indicators or, for passthrough
    /// functions when the host offers it, through host forwarding.
    pub(crate) fn register_interrupts(
        &self,
        function: &ZpciFunction,
        inner: &mut FunctionInner,
        mut config: InterruptConfig,
    ) -> Result<(), RegisterInterruptsError> {
        let host = &*self.services.host;
        if let Some(info) = function.passthrough.as_ref() {
            if self.config.interrupt_forwarding && host.forwarding_available() {
                let host_fh = host.host_handle(info.function).ok_or_else(|| {
                    HostControlError::Rejected("host function has no handle".into())
                })?;
                host.enable_forwarding(host_fh, config.isc, config.interrupts, &config.route)?;
                config.forwarded = true;
                tracing::debug!(
                    fid = function.fid,
                    host_fh = format_args!("{host_fh:#x}"),
                    "interrupt forwarding enabled"
                );
                inner.interrupts = Some(InterruptRegistration {
                    config,
                    indicators: None,
                });
                return Ok(());
            }
        }

        let adapters = &*self.services.adapters;
        let adapter_id = config.route.adapter_id;
        // Without the summary flag delivery never touches the summary byte.
        let summary = config
            .summary
            .then(|| self.indicators.get(config.route.summary_addr, 8));
        // Whole 64-bit words covering `interrupts` bits.
        let vector_len = u32::from(config.interrupts).div_ceil(64) * 8;
        let vector = self.indicators.get(config.route.indicator_addr, vector_len);
        let mapped = summary
            .as_ref()
            .map_or(Ok(()), |summary| {
                self.indicators.map(adapters, adapter_id, summary)
            })
            .and_then(|()| self.indicators.map(adapters, adapter_id, &vector));
        if let Err(err) = mapped {
            self.release_indicators(adapter_id, summary, vector);
            return Err(err.into());
        }

        config.forwarded = false;
        tracing::debug!(
            fid = function.fid,
            isc = config.isc,
            interrupts = config.interrupts,
            adapter_id,
            "register adapter interrupts"
        );
        inner.interrupts = Some(InterruptRegistration {
            config,
            indicators: Some((summary, vector)),
        });
        Ok(())
    }

    fn release_indicators(&self, adapter_id: u32, summary: Option<Indicator>, vector: Indicator) {
        let adapters = &*self.services.adapters;
        if let Some(summary) = summary {
            self.indicators.release(adapters, adapter_id, summary);
        }
        self.indicators.release(adapters, adapter_id, vector);
    }

    pub(crate) fn deregister_interrupts(&self, function: &ZpciFunction, inner: &mut FunctionInner) {
        let Some(registration) = inner.interrupts.take() else {
            return;
        };
        let adapter_id = registration.config.route.adapter_id;
        if let Some((summary, vector)) = registration.indicators {
            self.release_indicators(adapter_id, summary, vector);
        }
        if registration.config.forwarded {
            // The host may have replaced the handle since registration.
            let host = &*self.services.host;
            let result = function
                .passthrough
                .as_ref()
                .and_then(|info| host.host_handle(info.function))
                .map(|host_fh| host.disable_forwarding(host_fh));
            match result {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    tracing::warn!(
                        fid = function.fid,
                        %err,
                        "failed to disable interrupt forwarding"
                    )
                }
                None => tracing::warn!(fid = function.fid, "host function has no handle"),
            }
        }
        tracing::debug!(fid = function.fid, adapter_id, "deregister adapter interrupts");
    }
}
