mod cloud;
mod expire;
mod invariants;
mod queue;
mod scenarios;
