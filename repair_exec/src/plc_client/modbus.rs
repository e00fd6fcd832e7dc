//! Modbus TCP link to the PLC, using the synchronous `tokio-modbus` client.

use std::net::SocketAddr;
use tokio_modbus::{
    client::sync::{self, Reader, Writer},
    Error as ModbusError, ExceptionCode, Slave,
};

use super::{PlcClientError, PlcConnector, PlcEndpoint, PlcLink};

/// Connects to the PLC over Modbus TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModbusConnector;

struct ModbusLink {
    ctx: sync::Context,
}

impl PlcConnector for ModbusConnector {
    fn connect(&self, endpoint: &PlcEndpoint) -> Result<Box<dyn PlcLink>, PlcClientError> {
        let text = format!("{}:{}", endpoint.ip, endpoint.port);
        let addr: SocketAddr = text
            .parse()
            .map_err(|e| PlcClientError::ConnectFailed(text.clone(), format!("{}", e)))?;

        let ctx = sync::tcp::connect_slave_with_timeout(
            addr,
            Slave(endpoint.slave_id),
            Some(endpoint.connect_timeout),
        )
        .map_err(|e| PlcClientError::ConnectFailed(text, e.to_string()))?;

        Ok(Box::new(ModbusLink { ctx }))
    }
}

impl PlcLink for ModbusLink {
    fn read_coils(&mut self, index: u16, count: u16) -> Result<Vec<bool>, PlcClientError> {
        flatten(self.ctx.read_coils(index, count))
    }

    fn write_coil(&mut self, index: u16, value: bool) -> Result<(), PlcClientError> {
        flatten(self.ctx.write_single_coil(index, value))
    }

    fn read_holding_registers(
        &mut self,
        index: u16,
        count: u16,
    ) -> Result<Vec<u16>, PlcClientError> {
        flatten(self.ctx.read_holding_registers(index, count))
    }

    fn write_register(&mut self, index: u16, value: u16) -> Result<(), PlcClientError> {
        flatten(self.ctx.write_single_register(index, value))
    }

    fn write_registers(&mut self, index: u16, values: &[u16]) -> Result<(), PlcClientError> {
        flatten(self.ctx.write_multiple_registers(index, values))
    }
}

/// Collapse the transport and exception layers of a Modbus result.
fn flatten<T>(res: Result<Result<T, ExceptionCode>, ModbusError>) -> Result<T, PlcClientError> {
    match res {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(code)) => Err(PlcClientError::Exception(format!("{:?}", code))),
        Err(e) => Err(PlcClientError::Transport(e.to_string())),
    }
}
