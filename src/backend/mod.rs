pub mod engine {
    pub mod models;
    pub mod ticker;
    pub mod timer;
}

pub mod data {
    pub mod storage;
}

pub mod features {
    pub mod analytics;
    pub mod remote;
}

pub mod app {
    pub mod bootstrap;
    pub mod commands;
    pub mod runtime;
}

#[cfg(test)]
mod tests;
