//! Repository for organization members.

use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use uuid::Uuid;

use super::RepositoryError;
use crate::models::member::{Column, Entity as Member, Model};

pub struct MemberRepository<'a> {
    db: &'a DatabaseConnection,
}

impl<'a> MemberRepository<'a> {
    pub fn new(db: &'a DatabaseConnection) -> Self {
        Self { db }
    }

    /// A member scoped to its organization; membership in another
    /// organization does not resolve.
    pub async fn find_in_organization(
        &self,
        organization_id: Uuid,
        member_id: Uuid,
    ) -> Result<Option<Model>, RepositoryError> {
        let member = Member::find_by_id(member_id)
            .filter(Column::OrganizationId.eq(organization_id))
            .one(self.db)
            .await?;

        Ok(member)
    }
}
