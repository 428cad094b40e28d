//! Python bindings for the parameter server client.
//!
//! Exposes a blocking `Client` over TCP for a static fleet.

use crate::client::Client;
use crate::config::ClientConfig;
use crate::core::{ElementType, Error, Gradient, Parameter, ParameterWithConfig};
use crate::discovery::{FixedSelector, StaticRegistry};
use crate::rpc::TcpConnector;
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn to_py_err(err: Error) -> PyErr {
    match err {
        Error::UnknownParameter(name) => PyKeyError::new_err(name),
        Error::InvalidConfig(msg) | Error::InvalidGradient(msg) => PyValueError::new_err(msg),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

fn element_type(name: &str) -> PyResult<ElementType> {
    name.parse::<ElementType>().map_err(to_py_err)
}

#[pyclass(name = "Client")]
pub struct PyClient {
    inner: Client,
    runtime: Runtime,
}

#[pymethods]
impl PyClient {
    #[new]
    #[pyo3(signature = (addrs, selected, config_json=None))]
    fn new(addrs: Vec<String>, selected: bool, config_json: Option<&str>) -> PyResult<Self> {
        let config = match config_json {
            Some(json) => ClientConfig::from_json(json).map_err(to_py_err)?,
            None => ClientConfig::default(),
        };
        let runtime = Runtime::new().map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        let inner = Client::new(
            Arc::new(StaticRegistry::from_addrs(&addrs)),
            addrs.len(),
            Arc::new(FixedSelector::new(selected)),
            Arc::new(TcpConnector::new(config.clone())),
        )
        .with_config(config);
        Ok(Self { inner, runtime })
    }

    fn begin_init_params(&self) -> PyResult<bool> {
        self.runtime
            .block_on(self.inner.begin_init_params())
            .map_err(to_py_err)
    }

    #[pyo3(signature = (name, element_type_name, content, config=None))]
    fn init_param(
        &self,
        name: &str,
        element_type_name: &str,
        content: &[u8],
        config: Option<&[u8]>,
    ) -> PyResult<()> {
        let param = Parameter::new(name, element_type(element_type_name)?, content.to_vec());
        let pwc = ParameterWithConfig::new(param).with_config(config.unwrap_or_default().to_vec());
        self.runtime
            .block_on(self.inner.init_param(pwc))
            .map_err(to_py_err)
    }

    fn finish_init_params(&self) -> PyResult<()> {
        self.runtime
            .block_on(self.inner.finish_init_params())
            .map_err(to_py_err)
    }

    fn wait_ready(&self) -> PyResult<()> {
        self.runtime
            .block_on(self.inner.wait_ready())
            .map_err(to_py_err)
    }

    /// Takes `(name, element_type, content)` tuples.
    fn send_grads(&self, grads: Vec<(String, String, Vec<u8>)>) -> PyResult<()> {
        let grads = grads
            .into_iter()
            .map(|(name, t, content)| Ok(Gradient::new(&name, element_type(&t)?, content)))
            .collect::<PyResult<Vec<_>>>()?;
        self.runtime
            .block_on(self.inner.send_grads(grads))
            .map_err(to_py_err)
    }

    /// Returns `(name, element_type, content)` tuples in request order.
    fn get_params<'py>(
        &self,
        py: Python<'py>,
        names: Vec<String>,
    ) -> PyResult<Vec<(String, String, &'py PyBytes)>> {
        let params = self
            .runtime
            .block_on(self.inner.get_params(&names))
            .map_err(to_py_err)?;
        Ok(params
            .into_iter()
            .map(|p| {
                (
                    p.name,
                    p.element_type.to_string(),
                    PyBytes::new(py, &p.content),
                )
            })
            .collect())
    }
}

#[pymodule]
fn pserver(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyClient>()?;
    Ok(())
}
