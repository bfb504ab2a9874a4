//! Control commands accepted by an encoding stage

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::pipeline::allocator::BufferAllocator;
use crate::pipeline::flow::FlowDescriptor;
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::types::Frame;

/// Event pushed downstream by a stage
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Format of the frames that follow
    FlowDef(FlowDescriptor),
    /// Encoded frame
    Frame(Frame),
}

/// Downstream end of a stage
pub type OutputSender = mpsc::UnboundedSender<OutputEvent>;

/// Request to get or set one stage attribute
pub enum Control {
    GetAllocator,
    SetAllocator(Option<Arc<dyn BufferAllocator>>),
    GetOutput,
    SetOutput(Option<OutputSender>),
    GetScheduler,
    SetScheduler(Option<Scheduler>),
    GetInputFlow,
    /// Announce the format of the frames that follow on the input
    SetInputFlow(FlowDescriptor),
    GetOutputFlow,
    SetOutputFlow(FlowDescriptor),
    GetOption(String),
    /// Engine option applied at the next open; `None` removes it
    SetOption {
        name: String,
        value: Option<String>,
    },
}

impl Control {
    pub fn name(&self) -> &'static str {
        match self {
            Control::GetAllocator => "get_allocator",
            Control::SetAllocator(_) => "set_allocator",
            Control::GetOutput => "get_output",
            Control::SetOutput(_) => "set_output",
            Control::GetScheduler => "get_scheduler",
            Control::SetScheduler(_) => "set_scheduler",
            Control::GetInputFlow => "get_input_flow",
            Control::SetInputFlow(_) => "set_input_flow",
            Control::GetOutputFlow => "get_output_flow",
            Control::SetOutputFlow(_) => "set_output_flow",
            Control::GetOption(_) => "get_option",
            Control::SetOption { .. } => "set_option",
        }
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Answer to a [`Control`] request
pub enum ControlReply {
    /// Set commands
    Done,
    Allocator(Option<Arc<dyn BufferAllocator>>),
    Output(Option<OutputSender>),
    Scheduler(Option<Scheduler>),
    /// Input or output flow, as requested
    Flow(Option<FlowDescriptor>),
    Option(Option<String>),
}

impl std::fmt::Debug for ControlReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlReply::Done => f.write_str("Done"),
            ControlReply::Allocator(allocator) => {
                write!(f, "Allocator(set: {})", allocator.is_some())
            }
            ControlReply::Output(output) => write!(f, "Output(set: {})", output.is_some()),
            ControlReply::Scheduler(scheduler) => f.debug_tuple("Scheduler").field(scheduler).finish(),
            ControlReply::Flow(flow) => f.debug_tuple("Flow").field(flow).finish(),
            ControlReply::Option(value) => f.debug_tuple("Option").field(value).finish(),
        }
    }
}
