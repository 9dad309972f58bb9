use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler needs at least one site")]
    NoSites,

    #[error("completion channel closed")]
    ChannelClosed,
}
