//! Modbus RTU responder serving the device registry.

use std::sync::Arc;
use std::time::Duration;

use regbridge_common::{DeviceId, DeviceRegistry, RegistryError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::RegisterConfig;
use crate::encoding::RegisterLayout;
use crate::frame::{self, ExceptionCode, MAX_READ_QUANTITY, MAX_WRITE_QUANTITY, Request, Response};
use crate::transport::{Transport, TransportError};

/// Protocol address of the first register of every bank.
pub const REGISTER_BASE_ADDRESS: u16 = 0;

/// Pause after a failed receive before waiting again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where the responder is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResponderState {
    Idle,
    AwaitingFrame,
    Decoding,
    Dispatching,
    Encoding,
    Sending,
    Stopped,
}

/// Counters kept by the responder loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResponderStats {
    pub frames_received: u64,
    pub replies_sent: u64,
    pub exceptions_sent: u64,
    pub malformed_frames: u64,
    pub ignored_frames: u64,
    pub timeouts: u64,
    pub transport_errors: u64,
}

/// Answers Modbus RTU requests for every configured device on one line.
///
/// The responder owns its transport exclusively and touches shared state only
/// through the [`DeviceRegistry`].
pub struct ProtocolResponder<T> {
    transport: T,
    registry: Arc<DeviceRegistry>,
    layout: RegisterLayout,
    allow_writes: bool,
    timeout: Duration,
    state: ResponderState,
    stats: ResponderStats,
}

impl<T: Transport> ProtocolResponder<T> {
    pub fn new(
        transport: T,
        registry: Arc<DeviceRegistry>,
        registers: &RegisterConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            layout: RegisterLayout::from(registers),
            allow_writes: registers.allow_writes,
            timeout,
            state: ResponderState::Idle,
            stats: ResponderStats::default(),
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn stats(&self) -> &ResponderStats {
        &self.stats
    }

    /// Serve requests until `shutdown` reads `true` or its sender is dropped.
    ///
    /// The transport is dropped on return.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ResponderStats {
        info!(
            devices = ?self.registry.device_ids().collect::<Vec<_>>(),
            "Modbus RTU responder started"
        );

        while !*shutdown.borrow_and_update() {
            self.state = ResponderState::AwaitingFrame;

            let received = tokio::select! {
                received = self.transport.receive_frame(self.timeout) => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok(None) => {
                    self.stats.timeouts += 1;
                }
                Ok(Some(frame)) => {
                    if let Some(reply) = self.handle_frame(&frame) {
                        self.send(&reply).await;
                    }
                }
                Err(TransportError::Closed) => {
                    warn!("Serial transport closed, stopping responder");
                    break;
                }
                Err(e) => {
                    self.stats.transport_errors += 1;
                    warn!("Receive failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }

            self.state = ResponderState::Idle;
        }

        self.state = ResponderState::Stopped;
        info!(
            frames = self.stats.frames_received,
            replies = self.stats.replies_sent,
            malformed = self.stats.malformed_frames,
            "Modbus RTU responder stopped"
        );
        self.stats
    }

    async fn send(&mut self, reply: &[u8]) {
        self.state = ResponderState::Sending;
        match self.transport.send_frame(reply).await {
            Ok(()) => self.stats.replies_sent += 1,
            Err(e) => {
                self.stats.transport_errors += 1;
                warn!("Send failed: {}", e);
            }
        }
    }

    /// Decode one frame and build the reply, if any.
    ///
    /// Returns `None` for malformed frames, unsupported functions and frames
    /// addressed to units that are not configured.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        self.stats.frames_received += 1;

        self.state = ResponderState::Decoding;
        let decoded = match frame::decode_request(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.stats.malformed_frames += 1;
                debug!(len = frame.len(), "Dropping malformed frame: {}", e);
                return None;
            }
        };

        self.state = ResponderState::Dispatching;
        // Broadcasts are never answered.
        if decoded.unit == frame::BROADCAST_ADDRESS || !self.registry.contains(decoded.unit) {
            self.stats.ignored_frames += 1;
            trace!(unit = decoded.unit, "Frame for another unit");
            return None;
        }
        // With writes disabled the write functions are unsupported.
        if decoded.request.is_write() && !self.allow_writes {
            self.stats.malformed_frames += 1;
            debug!(
                unit = decoded.unit,
                function = decoded.request.function(),
                "Writes are disabled, dropping request"
            );
            return None;
        }

        let response = self.dispatch(decoded.unit, &decoded.request);
        if let Response::Exception { code, .. } = &response {
            self.stats.exceptions_sent += 1;
            debug!(unit = decoded.unit, ?code, request = ?decoded.request, "Exception reply");
        }

        self.state = ResponderState::Encoding;
        Some(frame::encode_response(decoded.unit, &response))
    }

    fn dispatch(&self, unit: DeviceId, request: &Request) -> Response {
        let function = request.function();
        let result = match request {
            Request::ReadHoldingRegisters { start, quantity }
            | Request::ReadInputRegisters { start, quantity } => self
                .read(unit, *start, *quantity)
                .map(|values| Response::ReadRegisters { function, values }),
            Request::WriteSingleRegister { address, value } => self
                .write(unit, *address, std::slice::from_ref(value))
                .map(|()| Response::WriteSingleRegister {
                    address: *address,
                    value: *value,
                }),
            Request::WriteMultipleRegisters { start, values } => {
                if values.is_empty() || values.len() > MAX_WRITE_QUANTITY as usize {
                    Err(ExceptionCode::IllegalDataValue)
                } else {
                    self.write(unit, *start, values)
                        .map(|()| Response::WriteMultipleRegisters {
                            start: *start,
                            quantity: values.len() as u16,
                        })
                }
            }
        };

        result.unwrap_or_else(|code| Response::Exception { function, code })
    }

    fn read(&self, unit: DeviceId, start: u16, quantity: u16) -> Result<Vec<u16>, ExceptionCode> {
        if quantity == 0 || quantity > MAX_READ_QUANTITY {
            return Err(ExceptionCode::IllegalDataValue);
        }

        let bank = self
            .registry
            .get_bank(unit)
            .map_err(|_| ExceptionCode::ServerDeviceFailure)?;
        let words = self.layout.encode(bank.values());

        let offset = start
            .checked_sub(REGISTER_BASE_ADDRESS)
            .ok_or(ExceptionCode::IllegalDataAddress)? as usize;
        let end = offset + quantity as usize;
        words
            .get(offset..end)
            .map(<[u16]>::to_vec)
            .ok_or(ExceptionCode::IllegalDataAddress)
    }

    fn write(&self, unit: DeviceId, start: u16, words: &[u16]) -> Result<(), ExceptionCode> {
        let per_value = self.layout.words_per_value();
        let offset = start
            .checked_sub(REGISTER_BASE_ADDRESS)
            .ok_or(ExceptionCode::IllegalDataAddress)? as usize;
        // A write must cover whole values.
        if offset % per_value != 0 || words.len() % per_value != 0 {
            return Err(ExceptionCode::IllegalDataAddress);
        }

        let values = self.layout.decode(words);
        self.registry
            .write_many(unit, offset / per_value, &values)
            .map_err(|e| match e {
                RegistryError::IndexOutOfRange { .. } => ExceptionCode::IllegalDataAddress,
                RegistryError::InvalidValue(_) => ExceptionCode::IllegalDataValue,
                RegistryError::InvalidDevice(_) => ExceptionCode::ServerDeviceFailure,
            })?;

        debug!(unit, start, count = values.len(), "Registers written by master");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegisterEncoding;
    use crate::frame::{READ_HOLDING_REGISTERS, encode_request};
    use regbridge_common::DeviceConfig;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    struct NoTransport;

    impl Transport for NoTransport {
        async fn receive_frame(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            tokio::time::sleep(timeout).await;
            Ok(None)
        }

        async fn send_frame(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Replays scripted receive results, then stays silent.
    ///
    /// The first `send_failures` sends fail; later replies go to `sent`.
    struct ScriptedTransport {
        incoming: VecDeque<Result<Option<Vec<u8>>, TransportError>>,
        send_failures: usize,
        sent: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl Transport for ScriptedTransport {
        async fn receive_frame(
            &mut self,
            timeout: Duration,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            match self.incoming.pop_front() {
                Some(next) => next,
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(None)
                }
            }
        }

        async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            if self.send_failures > 0 {
                self.send_failures -= 1;
                return Err(line_down());
            }
            let _ = self.sent.send(frame.to_vec());
            Ok(())
        }
    }

    fn line_down() -> TransportError {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "line down",
        ))
    }

    fn registry() -> Arc<DeviceRegistry> {
        Arc::new(
            DeviceRegistry::new(
                &[
                    DeviceConfig::new(1, ["P", "Q"]),
                    DeviceConfig::new(2, ["T", "V", "F"]),
                ],
                2,
            )
            .unwrap(),
        )
    }

    fn responder(registers: RegisterConfig) -> ProtocolResponder<NoTransport> {
        ProtocolResponder::new(NoTransport, registry(), &registers, Duration::from_secs(1))
    }

    fn read(unit: u8, start: u16, quantity: u16) -> Vec<u8> {
        encode_request(unit, &Request::ReadHoldingRegisters { start, quantity })
    }

    fn reply(unit: u8, response: Response) -> Option<Vec<u8>> {
        Some(frame::encode_response(unit, &response))
    }

    #[test]
    fn test_read_scaled_registers() {
        let mut responder = responder(RegisterConfig::default());
        responder.registry.write(1, 0, 10.0).unwrap();
        responder.registry.write(1, 1, 0.5).unwrap();

        assert_eq!(
            responder.handle_frame(&read(1, 0, 2)),
            reply(
                1,
                Response::ReadRegisters {
                    function: READ_HOLDING_REGISTERS,
                    values: vec![1000, 50],
                }
            )
        );
        assert_eq!(responder.state(), ResponderState::Encoding);
    }

    #[test]
    fn test_read_input_registers_serves_same_bank() {
        let mut responder = responder(RegisterConfig::default());
        responder.registry.write(2, 2, 1.25).unwrap();

        let request = encode_request(
            2,
            &Request::ReadInputRegisters {
                start: 2,
                quantity: 1,
            },
        );
        assert_eq!(
            responder.handle_frame(&request),
            reply(
                2,
                Response::ReadRegisters {
                    function: frame::READ_INPUT_REGISTERS,
                    values: vec![125],
                }
            )
        );
    }

    #[test]
    fn test_unconfigured_unit_is_silent() {
        let mut responder = responder(RegisterConfig::default());
        assert_eq!(responder.handle_frame(&read(5, 0, 1)), None);
        assert_eq!(responder.handle_frame(&read(0, 0, 1)), None);
        assert_eq!(responder.stats().ignored_frames, 2);
        assert_eq!(responder.stats().exceptions_sent, 0);
    }

    #[test]
    fn test_malformed_frame_is_silent() {
        let mut responder = responder(RegisterConfig::default());
        let mut frame = read(1, 0, 1);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        assert_eq!(responder.handle_frame(&frame), None);
        assert_eq!(responder.handle_frame(&[0x01]), None);
        assert_eq!(responder.stats().malformed_frames, 2);
    }

    #[test]
    fn test_read_out_of_bank_is_exception() {
        let mut responder = responder(RegisterConfig::default());
        assert_eq!(
            responder.handle_frame(&read(1, 1, 2)),
            reply(
                1,
                Response::Exception {
                    function: READ_HOLDING_REGISTERS,
                    code: ExceptionCode::IllegalDataAddress,
                }
            )
        );
        assert_eq!(
            responder.handle_frame(&read(1, 0, 0)),
            reply(
                1,
                Response::Exception {
                    function: READ_HOLDING_REGISTERS,
                    code: ExceptionCode::IllegalDataValue,
                }
            )
        );
        assert_eq!(
            responder.handle_frame(&read(1, 0, 126)),
            reply(
                1,
                Response::Exception {
                    function: READ_HOLDING_REGISTERS,
                    code: ExceptionCode::IllegalDataValue,
                }
            )
        );
        assert_eq!(responder.stats().exceptions_sent, 3);
    }

    #[test]
    fn test_write_single_register() {
        let mut responder = responder(RegisterConfig::default());
        let request = encode_request(
            2,
            &Request::WriteSingleRegister {
                address: 1,
                value: 4321,
            },
        );

        assert_eq!(responder.handle_frame(&request), Some(request.clone()));
        assert_eq!(responder.registry.get_bank(2).unwrap().get(1), Some(43.21));
    }

    #[test]
    fn test_write_multiple_f32() {
        let mut responder = responder(RegisterConfig {
            encoding: RegisterEncoding::F32,
            scale: 1.0,
            allow_writes: true,
        });
        let words = RegisterLayout::new(RegisterEncoding::F32, 1.0).encode(&[1.5, -2.25]);
        let request = encode_request(
            2,
            &Request::WriteMultipleRegisters {
                start: 2,
                values: words,
            },
        );

        assert_eq!(
            responder.handle_frame(&request),
            reply(
                2,
                Response::WriteMultipleRegisters {
                    start: 2,
                    quantity: 4
                }
            )
        );
        assert_eq!(
            responder.registry.get_bank(2).unwrap().values(),
            &[0.0, 1.5, -2.25]
        );
    }

    #[test]
    fn test_split_f32_write_is_rejected() {
        let mut responder = responder(RegisterConfig {
            encoding: RegisterEncoding::F32,
            scale: 1.0,
            allow_writes: true,
        });
        let request = encode_request(
            1,
            &Request::WriteSingleRegister {
                address: 0,
                value: 0x3FC0,
            },
        );

        assert_eq!(
            responder.handle_frame(&request),
            reply(
                1,
                Response::Exception {
                    function: frame::WRITE_SINGLE_REGISTER,
                    code: ExceptionCode::IllegalDataAddress,
                }
            )
        );
        assert_eq!(responder.registry.get_bank(1).unwrap().values(), &[0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_f32_write_is_rejected() {
        let mut responder = responder(RegisterConfig {
            encoding: RegisterEncoding::F32,
            scale: 1.0,
            allow_writes: true,
        });
        let nan = f32::NAN.to_bits();
        let request = encode_request(
            1,
            &Request::WriteMultipleRegisters {
                start: 0,
                values: vec![(nan >> 16) as u16, nan as u16],
            },
        );

        assert_eq!(
            responder.handle_frame(&request),
            reply(
                1,
                Response::Exception {
                    function: frame::WRITE_MULTIPLE_REGISTERS,
                    code: ExceptionCode::IllegalDataValue,
                }
            )
        );
    }

    #[test]
    fn test_writes_disabled_are_silent() {
        let mut responder = responder(RegisterConfig {
            allow_writes: false,
            ..RegisterConfig::default()
        });
        let request = encode_request(
            1,
            &Request::WriteSingleRegister {
                address: 0,
                value: 1,
            },
        );

        assert_eq!(responder.handle_frame(&request), None);
        assert_eq!(responder.registry.get_bank(1).unwrap().get(0), Some(0.0));
        assert_eq!(responder.stats().malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let responder = responder(RegisterConfig::default());
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(responder.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("responder did not stop")
            .unwrap();
        assert_eq!(stats.frames_received, 0);
    }

    #[tokio::test]
    async fn test_transport_errors_are_counted_and_loop_rearms() {
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            incoming: VecDeque::from([
                Err(line_down()),
                Ok(Some(read(1, 0, 1))),
                Ok(Some(read(1, 0, 1))),
            ]),
            send_failures: 1,
            sent: sent_tx,
        };
        let registry = registry();
        registry.write(1, 0, 2.5).unwrap();
        let responder = ProtocolResponder::new(
            transport,
            registry,
            &RegisterConfig::default(),
            Duration::from_millis(50),
        );
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(responder.run(rx));

        // Receive error, then a failed send, then a normal reply.
        let answer = tokio::time::timeout(Duration::from_secs(2), sent_rx.recv())
            .await
            .expect("no reply after transport errors")
            .unwrap();
        assert_eq!(
            Some(answer),
            reply(
                1,
                Response::ReadRegisters {
                    function: READ_HOLDING_REGISTERS,
                    values: vec![250],
                }
            )
        );

        tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("responder did not stop")
            .unwrap();
        assert_eq!(stats.transport_errors, 2);
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.replies_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_error_backoff() {
        let (sent_tx, _sent_rx) = mpsc::unbounded_channel();
        let transport = ScriptedTransport {
            incoming: VecDeque::from([Err(line_down())]),
            send_failures: 0,
            sent: sent_tx,
        };
        let responder = ProtocolResponder::new(
            transport,
            registry(),
            &RegisterConfig::default(),
            Duration::from_secs(1),
        );
        let (tx, rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        let task = tokio::spawn(responder.run(rx));

        // Let the responder hit the error and start backing off.
        tokio::task::yield_now().await;
        tx.send(true).unwrap();

        let stats = task.await.unwrap();
        assert_eq!(stats.transport_errors, 1);
        assert!(started.elapsed() < RECEIVE_ERROR_BACKOFF);
    }
}
