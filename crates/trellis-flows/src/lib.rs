//! Concrete agents, workflows and networks assembled from the engine.

pub mod activity;
pub mod research;
pub mod summarize;
pub mod weather;

pub use activity::{activity_planning_builder, planning_agent};
pub use research::{research_network, research_workflow, researcher_agent, synthesizer_agent};
pub use summarize::summarize_agent;
pub use weather::{Forecast, ForecastSource, WeatherClient};
