//! The seam between the harness and user workload code
//!
//! A *driver* is the user-supplied object whose methods hit the system
//! under test. The engine instantiates one driver per virtual user through
//! a [`DriverFactory`] and calls [`Driver::operate`] once per cycle with the
//! operation chosen by the mix. Drivers report failure through
//! [`DriverError`](crate::error::DriverError): `Failed` marks the operation
//! and continues, `Fatal` takes the whole run down.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::OperationDef;
use crate::engine::context::DriverContext;
use crate::error::DriverError;

/// User workload code for one virtual user
pub trait Driver: Send {
    /// Invoke one operation against the system under test.
    ///
    /// For `timing = "manual"` operations the implementation must call
    /// `ctx.record_time()` immediately before and after its critical
    /// section; for `timing = "auto"` the instrumented transport does so.
    fn operate(&mut self, op: &OperationDef, ctx: &mut DriverContext) -> Result<(), DriverError>;

    /// Once-before hook; executed by thread 0 only, before any thread
    /// enters its workload
    fn pre_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
        Ok(())
    }

    /// Once-after hook; executed by thread 0 only, after every thread has
    /// finished its workload
    fn post_run(&mut self, _ctx: &mut DriverContext) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Creates driver instances, one per virtual user
pub trait DriverFactory: Send + Sync {
    /// Driver type name, matched against `driver.name` in the run
    /// configuration
    fn driver_name(&self) -> &str;

    fn create(&self, thread_id: usize) -> Result<Box<dyn Driver>, DriverError>;
}

/// Maps driver type names to their factories.
///
/// The harness binary registers its built-in drivers here; embedding
/// applications register their own before starting the daemon.
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) {
        self.factories
            .insert(factory.driver_name().to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDriver;

    impl Driver for NoopDriver {
        fn operate(
            &mut self,
            _op: &OperationDef,
            ctx: &mut DriverContext,
        ) -> Result<(), DriverError> {
            ctx.record_time();
            ctx.record_time();
            Ok(())
        }
    }

    struct NoopFactory;

    impl DriverFactory for NoopFactory {
        fn driver_name(&self) -> &str {
            "noop"
        }

        fn create(&self, _thread_id: usize) -> Result<Box<dyn Driver>, DriverError> {
            Ok(Box::new(NoopDriver))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(NoopFactory));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("absent").is_none());
        assert_eq!(registry.names(), vec!["noop".to_string()]);
    }
}
