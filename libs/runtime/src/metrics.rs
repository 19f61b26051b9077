use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ControllerLabels {
    controller: String,
}

/// Per-controller runtime metrics, shared by every machine in the process.
#[derive(Clone, Default)]
pub struct RuntimeMetrics {
    wakeups: Family<ControllerLabels, Counter>,
    reconcile_failures: Family<ControllerLabels, Counter>,
    restarts: Family<ControllerLabels, Counter>,
    controllers: Gauge,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_into(&self, registry: &mut Registry) {
        registry.register(
            "controller_wakeups",
            "Number of times a controller was woken to reconcile",
            self.wakeups.clone(),
        );
        registry.register(
            "controller_reconcile_failures",
            "Number of reconcile passes that returned an error",
            self.reconcile_failures.clone(),
        );
        registry.register(
            "controller_restarts",
            "Number of controller restarts after a failed run",
            self.restarts.clone(),
        );
        registry.register(
            "controllers_running",
            "Number of controller tasks currently running",
            self.controllers.clone(),
        );
    }

    fn labels(controller: &str) -> ControllerLabels {
        ControllerLabels {
            controller: controller.to_string(),
        }
    }

    pub(crate) fn wakeup(&self, controller: &str) {
        self.wakeups.get_or_create(&Self::labels(controller)).inc();
    }

    pub(crate) fn reconcile_failure(&self, controller: &str) {
        self.reconcile_failures
            .get_or_create(&Self::labels(controller))
            .inc();
    }

    pub(crate) fn restart(&self, controller: &str) {
        self.restarts.get_or_create(&Self::labels(controller)).inc();
    }

    pub(crate) fn controller_started(&self) {
        self.controllers.inc();
    }

    pub(crate) fn controller_stopped(&self) {
        self.controllers.dec();
    }
}
