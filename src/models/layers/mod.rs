pub mod attention;
pub mod distributed;
pub mod expert_partition;
pub mod mlp;
pub mod moe;
