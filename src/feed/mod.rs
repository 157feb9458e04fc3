mod collector;

pub use collector::FeedCollector;
