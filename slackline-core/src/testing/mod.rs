// ABOUTME: Test doubles for every collaborator seam, shared by unit and integration tests
// ABOUTME: I/O mocks hand back pending DeferredResults that the test completes by hand

mod mock_io;
mod recording;

pub use mock_io::{ManualTimer, MockHttp, MockTransport, RecordedRequest};
pub use recording::{PlainRenderer, RecordingReporter, RecordingView, ViewEvent};

use crate::scheduler::Scheduler;
use crate::traits::Collaborators;
use std::rc::Rc;

/// A scheduler wired to a full set of mock collaborators.
pub struct TestHarness {
    pub scheduler: Scheduler,
    pub http: Rc<MockHttp>,
    pub transport: Rc<MockTransport>,
    pub timer: Rc<ManualTimer>,
    pub reporter: Rc<RecordingReporter>,
    pub view: Rc<RecordingView>,
}

impl TestHarness {
    pub fn new() -> Self {
        let reporter = Rc::new(RecordingReporter::default());
        Self {
            scheduler: Scheduler::new(reporter.clone()),
            http: Rc::new(MockHttp::default()),
            transport: Rc::new(MockTransport::default()),
            timer: Rc::new(ManualTimer::default()),
            reporter,
            view: Rc::new(RecordingView::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            http: self.http.clone(),
            transport: self.transport.clone(),
            timer: self.timer.clone(),
            reporter: self.reporter.clone(),
            renderer: Rc::new(PlainRenderer),
            view: self.view.clone(),
        }
    }

    /// Complete an external operation and drive whatever it unblocks.
    pub fn deliver(&self, complete: impl FnOnce()) {
        self.scheduler.deliver(complete);
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
