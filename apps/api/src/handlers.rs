pub mod executions;
pub mod health;
pub mod locks;
pub mod viewers;

#[cfg(test)]
mod test_support;
