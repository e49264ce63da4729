mod alarms;
mod recordings;
mod sessions;
mod stats;
