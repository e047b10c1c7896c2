pub mod apidefinitions;
pub mod managementcontexts;
